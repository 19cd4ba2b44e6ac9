//! Mutually authenticated TLS listener over relayed connections.
//!
//! The raw source is the relay allocation; every connection it yields must
//! start a TLS handshake, present a client certificate issued by the session
//! chain, and carry the expected Subject attributes before it is dispatched.
//! Rejections close only the offending connection.

use super::dispatcher::{ConnectionHandler, Dispatcher};
use super::lifecycle::ErrorSink;
use crate::config::SessionTimings;
use relaygate_core::{CertificateBundle, GatewayError, GatewayResult, PeerIdentity};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// A source of raw, unauthenticated byte-stream connections.
pub trait RawListener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Next connection. Must be cancel-safe.
    fn accept(&mut self) -> impl Future<Output = GatewayResult<(Self::Stream, SocketAddr)>> + Send;

    fn local_addr(&self) -> SocketAddr;
}

/// Server TLS settings for one session: the issued leaf as server identity,
/// TLS 1.2 minimum, and client certificates required and verified against
/// the issued chain.
pub fn server_tls_config(bundle: &CertificateBundle) -> GatewayResult<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let certs = parse_certs(&bundle.certificate, "certificate")?;
    if certs.is_empty() {
        return Err(GatewayError::Certificate("issued certificate is empty".into()));
    }
    let key = rustls_pemfile::private_key(&mut bundle.private_key.as_bytes())
        .map_err(|e| GatewayError::Certificate(format!("cannot parse private key: {e}")))?
        .ok_or_else(|| GatewayError::Certificate("no private key in bundle".into()))?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) =
        roots.add_parsable_certificates(parse_certs(&bundle.certificate_chain, "certificate chain")?);
    if added == 0 {
        return Err(GatewayError::Certificate(
            "certificate chain holds no usable CA certificate".into(),
        ));
    }
    if ignored > 0 {
        debug!(ignored, "skipped unparsable certificates in chain");
    }

    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| GatewayError::Tls(format!("client verifier: {e}")))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| GatewayError::Tls(format!("protocol versions: {e}")))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Certificate(format!("server certificate: {e}")))?;
    Ok(Arc::new(config))
}

fn parse_certs(pem: &str, what: &str) -> GatewayResult<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Certificate(format!("cannot parse {what}: {e}")))
}

/// A relayed connection classified by its first byte.
pub enum InboundConnection<S> {
    /// Opens with a TLS handshake record.
    Tls(BufReader<S>),
    /// Opens with anything else.
    Raw(BufReader<S>),
    /// Closed before sending a byte, as the relay liveness probe does.
    Empty,
}

impl<S: AsyncRead + AsyncWrite + Unpin> InboundConnection<S> {
    /// Peek the first byte without consuming it.
    pub async fn identify(stream: S) -> io::Result<Self> {
        let mut reader = BufReader::new(stream);
        let first = reader.fill_buf().await?.first().copied();
        Ok(match first {
            Some(TLS_HANDSHAKE_RECORD) => InboundConnection::Tls(reader),
            Some(_) => InboundConnection::Raw(reader),
            None => InboundConnection::Empty,
        })
    }
}

/// A connection that completed the handshake and passed authorization.
pub type VerifiedStream<S> = TlsStream<BufReader<S>>;

pub struct SecureListener<L> {
    raw: L,
    acceptor: TlsAcceptor,
    timings: SessionTimings,
}

impl<L: RawListener> SecureListener<L> {
    pub fn new(raw: L, bundle: &CertificateBundle, timings: SessionTimings) -> GatewayResult<Self> {
        let acceptor = TlsAcceptor::from(server_tls_config(bundle)?);
        Ok(Self {
            raw,
            acceptor,
            timings,
        })
    }

    /// Accept, verify and dispatch until `shutdown` fires or the raw
    /// listener fails fatally. Consumes the listener, so it closes once.
    ///
    /// `shutdown` is expected to be a child of the parent cancellation, so
    /// either one stops the loop.
    pub async fn run<H: ConnectionHandler>(
        mut self,
        mut dispatcher: Dispatcher<H>,
        shutdown: CancellationToken,
        errors: ErrorSink,
    ) -> Dispatcher<H> {
        info!(relayed = %self.raw.local_addr(), "secure listener accepting");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = tokio::time::timeout(self.timings.accept_poll, self.raw.accept()) => accepted,
            };

            let (stream, peer) = match accepted {
                Err(_elapsed) => continue,
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) if e.is_frame_noise() => {
                    trace!(error = %e, "ignoring relay frame noise");
                    continue;
                }
                Ok(Err(e)) if e.is_fatal() => {
                    error!(error = %e, "relay allocation failed, stopping listener");
                    errors.report(e).await;
                    break;
                }
                Ok(Err(e)) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };

            trace!(peer = %peer, "relayed connection accepted");
            let verification = verify(self.acceptor.clone(), self.timings.handshake_timeout, stream, peer);
            dispatcher.admit(peer, verification);
        }

        info!("secure listener stopped");
        dispatcher
    }
}

/// Classify, handshake and authorize one connection. `Ok(None)` means
/// the peer hung up before sending anything. Runs inside the connection's
/// own task, so a slow peer never holds up the accept loop.
async fn verify<S>(
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    stream: S,
    peer: SocketAddr,
) -> GatewayResult<Option<(VerifiedStream<S>, PeerIdentity)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = async {
        match InboundConnection::identify(stream).await {
            Ok(InboundConnection::Tls(stream)) => acceptor
                .accept(stream)
                .await
                .map(Some)
                .map_err(|e| GatewayError::Handshake(e.to_string())),
            Ok(InboundConnection::Raw(_)) => {
                Err(GatewayError::Handshake("connection is not TLS".into()))
            }
            Ok(InboundConnection::Empty) => Ok(None),
            Err(e) => Err(GatewayError::Io(e)),
        }
    };
    let Some(tls) = tokio::time::timeout(handshake_timeout, handshake)
        .await
        .map_err(|_| GatewayError::Handshake("handshake deadline exceeded".into()))??
    else {
        return Ok(None);
    };

    let leaf = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| GatewayError::Unauthorized("no client certificate presented".into()))?;
    let identity = PeerIdentity::from_der(leaf.as_ref())?;
    identity.authorize()?;

    debug!(peer = %peer, identity = %identity, "client verified");
    Ok(Some((tls, identity)))
}

/// Plain TCP as a raw source, for tests.
#[cfg(test)]
impl RawListener for tokio::net::TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&mut self) -> GatewayResult<(Self::Stream, SocketAddr)> {
        Ok(tokio::net::TcpListener::accept(self).await?)
    }

    fn local_addr(&self) -> SocketAddr {
        tokio::net::TcpListener::local_addr(self).unwrap()
    }
}
