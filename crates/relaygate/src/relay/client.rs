//! TURN client over a stream transport (RFC 5766 allocations, RFC 6062 TCP
//! relaying).
//!
//! One control connection carries every request. A reader task routes
//! responses to their waiting transaction by transaction id and turns each
//! `ConnectionAttempt` indication into a data connection: dial the relay
//! again, send `ConnectionBind`, and after the success response hand the raw
//! stream to whoever drains the incoming channel.

use super::dialer::{RelayDialer, RelayStream};
use relaygate_core::codec::Frame;
use relaygate_core::stun::{
    self, attr, code, Class, Integrity, Message, Method, HEADER_LEN, MAGIC_COOKIE,
    TRANSACTION_ID_LEN, TRANSPORT_TCP,
};
use relaygate_core::{GatewayError, GatewayResult, RelayCredentials, StunFrameDecoder};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A relayed peer connection, or an error surfaced by the control connection.
pub type Incoming = GatewayResult<(RelayStream, SocketAddr)>;

/// Lifetime asked for when the server does not state one.
pub const DEFAULT_LIFETIME_SECS: u32 = 600;

const INCOMING_CAPACITY: usize = 64;
const READ_BUF_SIZE: usize = 16 * 1024;

type TransactionId = [u8; TRANSACTION_ID_LEN];
type Reply = (Message, Vec<u8>);

/// Long-term credential state learned from the server's challenge.
#[derive(Clone)]
struct AuthState {
    realm: String,
    nonce: String,
    key: Vec<u8>,
}

struct Inner {
    dialer: RelayDialer,
    credentials: RelayCredentials,
    transaction_timeout: Duration,
    writer: Mutex<WriteHalf<RelayStream>>,
    pending: Mutex<HashMap<TransactionId, oneshot::Sender<Reply>>>,
    auth: Mutex<Option<AuthState>>,
    incoming_tx: mpsc::Sender<Incoming>,
    /// Set once the control reader has stopped.
    closed: AtomicBool,
}

/// Client side of one TURN control connection.
pub struct TurnClient {
    inner: Arc<Inner>,
    reader: JoinHandle<()>,
}

impl TurnClient {
    /// Dial the relay and start the control reader.
    ///
    /// Relayed peer connections, and fatal control errors, arrive on the
    /// returned receiver.
    pub async fn connect(
        dialer: RelayDialer,
        credentials: RelayCredentials,
        transaction_timeout: Duration,
    ) -> GatewayResult<(Self, mpsc::Receiver<Incoming>)> {
        let control = dialer.dial().await?;
        let (read_half, write_half) = tokio::io::split(control);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        let inner = Arc::new(Inner {
            dialer,
            credentials,
            transaction_timeout,
            writer: Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            auth: Mutex::new(None),
            incoming_tx,
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(inner.clone(), read_half));
        Ok((Self { inner, reader }, incoming_rx))
    }

    /// Sender feeding the incoming channel, for reporting allocation errors.
    pub fn incoming_sender(&self) -> mpsc::Sender<Incoming> {
        self.inner.incoming_tx.clone()
    }

    /// Request a TCP allocation. Returns the relayed address and granted lifetime.
    pub async fn allocate_tcp(&self) -> GatewayResult<(SocketAddr, u32)> {
        let response = self
            .authenticated_request(Method::Allocate, |req| {
                req.set_requested_transport(TRANSPORT_TCP);
            })
            .await?;

        let relayed = response
            .xor_address(attr::XOR_RELAYED_ADDRESS)
            .ok_or_else(|| {
                GatewayError::Allocation("allocate response lacks XOR-RELAYED-ADDRESS".into())
            })?;
        let lifetime = response.lifetime().unwrap_or(DEFAULT_LIFETIME_SECS);
        info!(relayed = %relayed, lifetime, "relay allocation granted");
        Ok((relayed, lifetime))
    }

    /// Refresh the allocation. A `lifetime` of zero deletes it.
    pub async fn refresh(&self, lifetime: u32) -> GatewayResult<u32> {
        let response = self
            .authenticated_request(Method::Refresh, |req| {
                req.set_lifetime(lifetime);
            })
            .await?;
        Ok(response.lifetime().unwrap_or(lifetime))
    }

    /// Install or renew a permission for `peer`.
    pub async fn create_permission(&self, peer: SocketAddr) -> GatewayResult<()> {
        self.authenticated_request(Method::CreatePermission, |req| {
            req.set_xor_address(attr::XOR_PEER_ADDRESS, peer);
        })
        .await?;
        Ok(())
    }

    /// Send a request with long-term credentials, answering one
    /// `401 Unauthorized` or `438 Stale Nonce` challenge.
    async fn authenticated_request(
        &self,
        method: Method,
        fill: impl Fn(&mut Message),
    ) -> GatewayResult<Message> {
        let mut challenged = false;
        loop {
            let mut request = Message::new(method, Class::Request);
            fill(&mut request);

            let auth = self.inner.auth.lock().await.clone();
            let encoded = match &auth {
                Some(auth) => {
                    request.set_credentials(&self.inner.credentials.username, &auth.realm, &auth.nonce);
                    request.encode_with_integrity(&auth.key)
                }
                None => request.encode(),
            };

            let (response, raw) = self.transact(request.transaction_id, encoded).await?;
            match response.class {
                Class::Success => {
                    if let Some(auth) = &auth {
                        if stun::check_integrity(&raw, &auth.key) == Integrity::Invalid {
                            return Err(GatewayError::Allocation(format!(
                                "{} response failed integrity check",
                                method.name()
                            )));
                        }
                    }
                    return Ok(response);
                }
                Class::Error => {
                    let (code, reason) = response
                        .error_code()
                        .unwrap_or((0, "missing ERROR-CODE".to_string()));
                    let retryable = code == code::UNAUTHORIZED || code == code::STALE_NONCE;
                    if retryable && !challenged {
                        if let Some(nonce) = response.nonce() {
                            debug!(method = method.name(), code, "answering relay auth challenge");
                            self.learn_challenge(&response, nonce).await;
                            challenged = true;
                            continue;
                        }
                    }
                    return Err(GatewayError::TurnRequest {
                        method: method.name(),
                        code,
                        reason,
                    });
                }
                _ => {
                    return Err(GatewayError::Allocation(format!(
                        "unexpected {} response class",
                        method.name()
                    )))
                }
            }
        }
    }

    async fn learn_challenge(&self, response: &Message, nonce: String) {
        let mut auth = self.inner.auth.lock().await;
        let realm = response
            .realm()
            .or_else(|| auth.as_ref().map(|a| a.realm.clone()))
            .unwrap_or_else(|| self.inner.credentials.realm.clone());
        let key = stun::long_term_key(
            &self.inner.credentials.username,
            &realm,
            &self.inner.credentials.password,
        );
        *auth = Some(AuthState { realm, nonce, key });
    }

    async fn transact(&self, transaction_id: TransactionId, encoded: Vec<u8>) -> GatewayResult<Reply> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(transaction_id, tx);
        if self.inner.closed.load(Ordering::SeqCst) {
            self.inner.pending.lock().await.remove(&transaction_id);
            return Err(GatewayError::AllocationClosed("control connection closed".into()));
        }

        let written = {
            let mut writer = self.inner.writer.lock().await;
            match writer.write_all(&encoded).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.inner.pending.lock().await.remove(&transaction_id);
            return Err(GatewayError::AllocationClosed(format!("control write failed: {e}")));
        }

        match tokio::time::timeout(self.inner.transaction_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(GatewayError::AllocationClosed(
                "control connection closed during transaction".into(),
            )),
            Err(_) => {
                self.inner.pending.lock().await.remove(&transaction_id);
                Err(GatewayError::Timeout)
            }
        }
    }

    /// Stop the control reader. Outstanding transactions fail.
    pub fn shutdown(&self) {
        self.reader.abort();
    }
}

impl Drop for TurnClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(inner: Arc<Inner>, mut control: ReadHalf<RelayStream>) {
    let mut decoder = StunFrameDecoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    let reason = loop {
        let n = match control.read(&mut buf).await {
            Ok(0) => break "relay closed the control connection".to_string(),
            Ok(n) => n,
            Err(e) => break format!("control read failed: {e}"),
        };

        for frame in decoder.feed(&buf[..n]) {
            match frame {
                Ok(Frame::Stun { message, raw }) => handle_message(&inner, message, raw).await,
                Ok(Frame::ChannelData { channel, data }) => {
                    trace!(channel, len = data.len(), "ignoring channel data on control connection");
                }
                Err(e) => {
                    let _ = inner.incoming_tx.send(Err(e)).await;
                }
            }
        }
    };

    debug!(reason = %reason, "relay control reader stopped");
    inner.closed.store(true, Ordering::SeqCst);
    inner.pending.lock().await.clear();
    let _ = inner
        .incoming_tx
        .send(Err(GatewayError::AllocationClosed(reason)))
        .await;
}

async fn handle_message(inner: &Arc<Inner>, message: Message, raw: Vec<u8>) {
    match message.class {
        Class::Success | Class::Error => {
            match inner.pending.lock().await.remove(&message.transaction_id) {
                Some(tx) => {
                    let _ = tx.send((message, raw));
                }
                None => trace!(method = message.method.name(), "response for unknown transaction"),
            }
        }
        Class::Indication if message.method == Method::ConnectionAttempt => {
            let (Some(connection_id), Some(peer)) = (
                message.connection_id(),
                message.xor_address(attr::XOR_PEER_ADDRESS),
            ) else {
                warn!("ConnectionAttempt without CONNECTION-ID or XOR-PEER-ADDRESS");
                return;
            };
            debug!(connection_id, peer = %peer, "relay connection attempt");
            let inner = inner.clone();
            tokio::spawn(async move {
                // A failed bind concerns only this peer and never reaches the listener.
                match bind_connection(&inner, connection_id).await {
                    Ok(stream) => {
                        let _ = inner.incoming_tx.send(Ok((stream, peer))).await;
                    }
                    Err(
                        e @ (GatewayError::TurnRequest { .. } | GatewayError::Io(_) | GatewayError::Timeout),
                    ) => {
                        debug!(connection_id, peer = %peer, error = %e, "peer left before connection bind completed");
                    }
                    Err(e) => warn!(connection_id, peer = %peer, error = %e, "connection bind failed"),
                }
            });
        }
        _ => trace!(method = message.method.name(), "ignoring relay message"),
    }
}

/// Open a data connection for `connection_id` (RFC 6062 section 4.3).
///
/// A stale nonce is retried once on a fresh connection, since the server
/// closes a data connection whose bind failed.
async fn bind_connection(inner: &Inner, connection_id: u32) -> GatewayResult<RelayStream> {
    let mut retried = false;
    loop {
        let mut stream = inner.dialer.dial().await?;
        let auth = inner.auth.lock().await.clone().ok_or_else(|| {
            GatewayError::RelayConnect("connection attempt before authentication".into())
        })?;

        let mut request = Message::new(Method::ConnectionBind, Class::Request);
        request
            .set_connection_id(connection_id)
            .set_credentials(&inner.credentials.username, &auth.realm, &auth.nonce);
        stream.write_all(&request.encode_with_integrity(&auth.key)).await?;
        stream.flush().await?;

        let (response, _) = tokio::time::timeout(inner.transaction_timeout, read_message(&mut stream))
            .await
            .map_err(|_| GatewayError::Timeout)??;
        if response.transaction_id != request.transaction_id {
            return Err(GatewayError::MalformedFrame(
                "ConnectionBind response for another transaction".into(),
            ));
        }

        match response.class {
            Class::Success => return Ok(stream),
            _ => {
                let (code, reason) = response
                    .error_code()
                    .unwrap_or((0, "missing ERROR-CODE".to_string()));
                if code == code::STALE_NONCE && !retried {
                    if let Some(nonce) = response.nonce() {
                        let mut state = inner.auth.lock().await;
                        if let Some(state) = state.as_mut() {
                            state.nonce = nonce;
                        }
                        retried = true;
                        continue;
                    }
                }
                return Err(GatewayError::TurnRequest {
                    method: Method::ConnectionBind.name(),
                    code,
                    reason,
                });
            }
        }
    }
}

/// Read exactly one STUN message from `reader`, leaving any bytes after it
/// unread.
pub(crate) async fn read_message<R>(reader: &mut R) -> GatewayResult<(Message, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut raw = vec![0u8; HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    if raw[0] & 0xC0 != 0 || u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]) != MAGIC_COOKIE {
        return Err(GatewayError::MalformedFrame(
            "data contains incomplete STUN or TURN frame".into(),
        ));
    }
    let body_len = usize::from(u16::from_be_bytes([raw[2], raw[3]]));
    raw.resize(HEADER_LEN + body_len, 0);
    reader.read_exact(&mut raw[HEADER_LEN..]).await?;
    let message = Message::decode(&raw)?;
    Ok((message, raw))
}
