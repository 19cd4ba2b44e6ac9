//! Dialing the TURN relay server.
//!
//! The relay port picks the transport: `5349` (TURN over TLS) wraps the TCP
//! connection in a client TLS session verified against the web PKI roots
//! with the relay host as server name; every other port is plain TCP.

use relaygate_core::{GatewayError, GatewayResult};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Port that selects TURN over TLS.
pub const TURN_TLS_PORT: u16 = 5349;

/// Split `host:port` (or `[v6]:port`) into its parts.
pub fn split_host_port(address: &str) -> GatewayResult<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| GatewayError::RelayConnect(format!("missing port in {address}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| GatewayError::RelayConnect(format!("invalid port in {address}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(GatewayError::RelayConnect(format!("missing host in {address}")));
    }
    Ok((host.to_string(), port))
}

/// Opens control and data connections to one relay server.
#[derive(Clone)]
pub struct RelayDialer {
    address: String,
    host: String,
    port: u16,
    timeout: Duration,
    tls: Option<TlsConnector>,
}

impl RelayDialer {
    pub fn new(server_address: &str, timeout: Duration) -> GatewayResult<Self> {
        let (host, port) = split_host_port(server_address)?;
        let tls = if port == TURN_TLS_PORT {
            Some(TlsConnector::from(Arc::new(relay_client_config()?)))
        } else {
            None
        };
        Ok(Self {
            address: server_address.to_string(),
            host,
            port,
            timeout,
            tls,
        })
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Open one connection to the relay, bounded by the dial timeout.
    pub async fn dial(&self) -> GatewayResult<RelayStream> {
        tokio::time::timeout(self.timeout, self.dial_inner())
            .await
            .map_err(|_| {
                GatewayError::RelayConnect(format!("timed out connecting to {}", self.address))
            })?
    }

    async fn dial_inner(&self) -> GatewayResult<RelayStream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| GatewayError::RelayConnect(format!("{}: {e}", self.address)))?;
        let _ = tcp.set_nodelay(true);

        let Some(connector) = &self.tls else {
            debug!(relay = %self.address, "relay connection established (tcp)");
            return Ok(RelayStream::Tcp(tcp));
        };

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| GatewayError::Tls(format!("invalid relay server name {}: {e}", self.host)))?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| GatewayError::Tls(format!("relay TLS handshake with {}: {e}", self.address)))?;
        debug!(relay = %self.address, "relay connection established (tls)");
        Ok(RelayStream::Tls(Box::new(tls)))
    }
}

fn relay_client_config() -> GatewayResult<ClientConfig> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::Tls(format!("relay TLS config: {e}")))?
            .with_root_certificates(roots)
            .with_no_client_auth();
    Ok(config)
}

/// A connection to the relay, plain or TLS.
pub enum RelayStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for RelayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayStream::Tcp(_) => f.write_str("RelayStream::Tcp"),
            RelayStream::Tls(_) => f.write_str("RelayStream::Tls"),
        }
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RelayStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            RelayStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
