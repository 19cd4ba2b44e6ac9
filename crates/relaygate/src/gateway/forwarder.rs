//! Default connection handler: pipes each verified connection to a local
//! upstream TCP service.

use super::dispatcher::{ConnectionHandler, PeerContext};
use relaygate_core::{GatewayError, GatewayResult};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Forwards verified connections to `upstream` (`host:port`).
#[derive(Debug, Clone)]
pub struct TcpForwardHandler {
    upstream: String,
    connect_timeout: Duration,
}

impl TcpForwardHandler {
    pub fn new(upstream: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            upstream: upstream.into(),
            connect_timeout,
        }
    }
}

impl ConnectionHandler for TcpForwardHandler {
    async fn handle<S>(&self, mut stream: S, peer: PeerContext) -> GatewayResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut upstream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.upstream))
            .await
            .map_err(|_| GatewayError::Other(format!("connect to upstream {} timed out", self.upstream)))?
            .map_err(|e| GatewayError::Other(format!("connect to upstream {}: {e}", self.upstream)))?;
        let _ = upstream.set_nodelay(true);

        info!(
            connection_id = peer.connection_id,
            peer = %peer.remote_addr,
            upstream = %self.upstream,
            identity = %peer.identity,
            "forwarding connection"
        );

        let (from_client, from_upstream) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        debug!(
            connection_id = peer.connection_id,
            from_client,
            from_upstream,
            "forwarded connection closed"
        );
        Ok(())
    }
}
