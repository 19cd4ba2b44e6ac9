//! Hands relayed connections to the connection handler.
//!
//! Every connection runs as its own task in a [`JoinSet`], which doubles as
//! the in-flight set. A task first awaits the connection's verification
//! (handshake and authorization), then runs the handler. Both stages race
//! the session shutdown signal; when shutdown wins the pending future is
//! dropped, which closes the connection.

use relaygate_core::{GatewayResult, PeerIdentity};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Who is on the other end of a dispatched connection.
#[derive(Debug, Clone)]
pub struct PeerContext {
    /// Per-session sequence number, for log correlation.
    pub connection_id: u64,
    pub remote_addr: SocketAddr,
    pub identity: PeerIdentity,
}

/// Application logic run for each verified connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle<S>(&self, stream: S, peer: PeerContext) -> impl Future<Output = GatewayResult<()>> + Send
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

/// Outcome of draining the in-flight set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub aborted: usize,
}

pub struct Dispatcher<H> {
    handler: Arc<H>,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    max_connections: Option<usize>,
    next_id: u64,
}

impl<H: ConnectionHandler> Dispatcher<H> {
    /// `max_connections` caps the in-flight set; `None` means unlimited.
    pub fn new(handler: Arc<H>, shutdown: CancellationToken, max_connections: Option<usize>) -> Self {
        Self {
            handler,
            shutdown,
            tasks: JoinSet::new(),
            max_connections,
            next_id: 0,
        }
    }

    /// Number of connections still being verified or handled.
    pub fn in_flight(&mut self) -> usize {
        self.reap();
        self.tasks.len()
    }

    /// Drop the entries of tasks that already finished.
    fn reap(&mut self) {
        while self.tasks.try_join_next().is_some() {}
    }

    /// Start handling an already verified `stream`.
    #[cfg(test)]
    pub fn dispatch<S>(&mut self, stream: S, remote_addr: SocketAddr, identity: PeerIdentity) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.admit(remote_addr, std::future::ready(Ok(Some((stream, identity)))))
    }

    /// Track a new connection whose `verification` yields the authorized
    /// stream, `Ok(None)` when the peer left without sending anything, or
    /// the rejection. The handler only runs after verification succeeds.
    ///
    /// Returns `false` when the connection was refused because the
    /// in-flight cap is reached or shutdown has begun. Connections still in
    /// their handshake count toward the cap.
    pub fn admit<F, S>(&mut self, remote_addr: SocketAddr, verification: F) -> bool
    where
        F: Future<Output = GatewayResult<Option<(S, PeerIdentity)>>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let current = self.in_flight();
        if self.shutdown.is_cancelled() {
            debug!(peer = %remote_addr, "shutdown in progress, dropping connection");
            return false;
        }
        if let Some(max) = self.max_connections {
            if current >= max {
                warn!(peer = %remote_addr, current, max, "connection limit reached, closing connection");
                return false;
            }
        }

        self.next_id += 1;
        let connection_id = self.next_id;
        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            let serve = async move {
                let (stream, identity) = match verification.await {
                    Ok(Some(verified)) => verified,
                    Ok(None) => {
                        debug!(connection_id, peer = %remote_addr, "connection closed before sending data");
                        return;
                    }
                    Err(e) => {
                        warn!(connection_id, peer = %remote_addr, error = %e, "rejected connection");
                        return;
                    }
                };
                info!(connection_id, peer = %remote_addr, identity = %identity, "dispatching connection");
                let peer = PeerContext {
                    connection_id,
                    remote_addr,
                    identity,
                };
                match handler.handle(stream, peer).await {
                    Ok(()) => debug!(connection_id, "connection finished"),
                    Err(e) => warn!(connection_id, error = %e, "connection handler failed"),
                }
            };
            tokio::select! {
                _ = serve => {}
                _ = shutdown.cancelled() => {
                    debug!(connection_id, "closing connection on shutdown");
                }
            }
        });
        true
    }

    /// Wait up to `grace` for in-flight connections, then abort the rest.
    pub async fn drain(&mut self, grace: Duration) -> DrainReport {
        let mut completed = 0;
        let waited = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {
                completed += 1;
            }
        })
        .await;

        let mut aborted = 0;
        if waited.is_err() {
            aborted = self.tasks.len();
            warn!(aborted, "grace period elapsed, terminating remaining connections");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        DrainReport { completed, aborted }
    }
}
