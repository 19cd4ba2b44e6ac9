//! In-process TURN server speaking just enough RFC 5766/6062 over TCP for
//! tests: a 401 challenge, Allocate, Refresh, CreatePermission,
//! ConnectionAttempt for peers dialing the relayed port, and ConnectionBind.

use super::client::read_message;
use relaygate_core::stun::{self, attr, code, Class, Integrity, Message, Method};
use relaygate_core::{GatewayResult, RelayCredentials};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub const USERNAME: &str = "gateway-user";
pub const PASSWORD: &str = "relay-secret";
pub const REALM: &str = "relay.test";
const NONCE: &str = "f00dfeed";

/// What the fake server has seen so far.
#[derive(Debug, Clone, Default)]
pub struct FakeTurnLog {
    pub challenges: usize,
    pub allocations: usize,
    pub refreshes: Vec<u32>,
    pub permissions: Vec<SocketAddr>,
    pub binds: usize,
    pub rejected_binds: usize,
}

#[derive(Default)]
struct State {
    log: FakeTurnLog,
    control_tx: Option<mpsc::Sender<Vec<u8>>>,
    waiting_peers: HashMap<u32, TcpStream>,
    next_connection_id: u32,
    reject_binds: bool,
}

pub struct FakeTurnServer {
    address: SocketAddr,
    relayed: SocketAddr,
    state: Arc<Mutex<State>>,
    allocations: CancellationToken,
    stop: CancellationToken,
}

impl FakeTurnServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relayed_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let relayed = relayed_listener.local_addr().unwrap();

        let state = Arc::new(Mutex::new(State {
            next_connection_id: 1,
            ..State::default()
        }));
        let stop = CancellationToken::new();
        let allocations = stop.child_token();

        tokio::spawn(accept_server(listener, relayed, state.clone(), allocations.clone()));
        tokio::spawn(accept_peers(relayed_listener, state.clone(), stop.clone()));

        Self {
            address,
            relayed,
            state,
            allocations,
            stop,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn relayed_address(&self) -> SocketAddr {
        self.relayed
    }

    pub fn credentials(&self) -> RelayCredentials {
        RelayCredentials {
            server_address: self.address.to_string(),
            username: USERNAME.into(),
            password: PASSWORD.into(),
            realm: REALM.into(),
        }
    }

    pub async fn log(&self) -> FakeTurnLog {
        self.state.lock().await.log.clone()
    }

    /// Answer every later ConnectionBind with 400, as a relay does once the
    /// peer behind the connection id has gone.
    pub async fn reject_binds(&self) {
        self.state.lock().await.reject_binds = true;
    }

    /// Close every control connection, as a relay dropping its allocations.
    pub fn drop_allocations(&self) {
        self.allocations.cancel();
    }
}

impl Drop for FakeTurnServer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn accept_server(
    listener: TcpListener,
    relayed: SocketAddr,
    state: Arc<Mutex<State>>,
    allocations: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = allocations.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => return,
            },
        };
        let state = state.clone();
        let allocations = allocations.clone();
        tokio::spawn(async move {
            let _ = serve_connection(stream, relayed, state, allocations).await;
        });
    }
}

async fn accept_peers(listener: TcpListener, state: Arc<Mutex<State>>, stop: CancellationToken) {
    loop {
        let (peer, peer_addr) = tokio::select! {
            _ = stop.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(_) => return,
            },
        };

        let (control_tx, connection_id) = {
            let mut state = state.lock().await;
            let Some(control_tx) = state.control_tx.clone() else {
                continue;
            };
            let connection_id = state.next_connection_id;
            state.next_connection_id += 1;
            state.waiting_peers.insert(connection_id, peer);
            (control_tx, connection_id)
        };

        let mut attempt = Message::new(Method::ConnectionAttempt, Class::Indication);
        attempt
            .set_connection_id(connection_id)
            .set_xor_address(attr::XOR_PEER_ADDRESS, peer_addr);
        let _ = control_tx.send(attempt.encode()).await;
    }
}

fn key() -> Vec<u8> {
    stun::long_term_key(USERNAME, REALM, PASSWORD)
}

fn authenticated(raw: &[u8]) -> bool {
    stun::check_integrity(raw, &key()) == Integrity::Valid
}

fn challenge(request: &Message) -> Vec<u8> {
    let mut response = Message::response_to(request, Class::Error);
    response
        .set_error_code(code::UNAUTHORIZED, "Unauthorized")
        .add(attr::REALM, REALM.as_bytes())
        .add(attr::NONCE, NONCE.as_bytes());
    response.encode()
}

async fn serve_connection(
    stream: TcpStream,
    relayed: SocketAddr,
    state: Arc<Mutex<State>>,
    allocations: CancellationToken,
) -> GatewayResult<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (first, raw) = read_message(&mut reader).await?;

    if first.method == Method::ConnectionBind {
        let connection_id = first.connection_id().unwrap_or_default();
        let (peer, rejecting) = {
            let mut state = state.lock().await;
            (state.waiting_peers.remove(&connection_id), state.reject_binds)
        };
        let Some(mut peer) = peer.filter(|_| !rejecting && authenticated(&raw)) else {
            state.lock().await.log.rejected_binds += 1;
            let mut response = Message::response_to(&first, Class::Error);
            response.set_error_code(400, "Bad Request");
            writer.write_all(&response.encode()).await?;
            return Ok(());
        };
        state.lock().await.log.binds += 1;
        let response = Message::response_to(&first, Class::Success);
        writer.write_all(&response.encode_with_integrity(&key())).await?;

        let mut data = reader.reunite(writer).map_err(|e| std::io::Error::other(e.to_string()))?;
        let _ = tokio::io::copy_bidirectional(&mut data, &mut peer).await;
        return Ok(());
    }

    // Control connection: outbound indications and responses share one writer.
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(16);
    state.lock().await.control_tx = Some(out_tx.clone());
    tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut next = Some((first, raw));
    loop {
        let (request, raw) = match next.take() {
            Some(message) => message,
            None => tokio::select! {
                _ = allocations.cancelled() => break,
                read = read_message(&mut reader) => match read {
                    Ok(message) => message,
                    Err(_) => break,
                },
            },
        };
        let reply = answer(&request, &raw, relayed, &state).await;
        if out_tx.send(reply).await.is_err() {
            break;
        }
    }

    state.lock().await.control_tx = None;
    Ok(())
}

async fn answer(
    request: &Message,
    raw: &[u8],
    relayed: SocketAddr,
    state: &Mutex<State>,
) -> Vec<u8> {
    let mut state = state.lock().await;
    if !authenticated(raw) {
        state.log.challenges += 1;
        return challenge(request);
    }

    let mut response = Message::response_to(request, Class::Success);
    match request.method {
        Method::Allocate => {
            state.log.allocations += 1;
            response
                .set_xor_address(attr::XOR_RELAYED_ADDRESS, relayed)
                .set_lifetime(600);
        }
        Method::Refresh => {
            let lifetime = request.lifetime().unwrap_or(600);
            state.log.refreshes.push(lifetime);
            response.set_lifetime(lifetime);
        }
        Method::CreatePermission => {
            if let Some(peer) = request.xor_address(attr::XOR_PEER_ADDRESS) {
                state.log.permissions.push(peer);
            }
        }
        _ => {
            let mut error = Message::response_to(request, Class::Error);
            error.set_error_code(400, "Bad Request");
            return error.encode();
        }
    }
    response.encode_with_integrity(&key())
}
