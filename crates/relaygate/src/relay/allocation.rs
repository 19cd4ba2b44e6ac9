//! A TCP allocation on the relay, kept alive for the life of a session.
//!
//! [`TcpAllocation`] owns the stream of relayed peer connections and is what
//! the secure listener accepts from. [`AllocationHandle`] is the cloneable
//! side used for permissions and teardown.

use super::client::{Incoming, TurnClient, DEFAULT_LIFETIME_SECS};
use super::dialer::{RelayDialer, RelayStream};
use crate::config::SessionTimings;
use crate::gateway::listener::RawListener;
use relaygate_core::{GatewayError, GatewayResult, RelayCredentials};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Shared {
    client: TurnClient,
    relayed: SocketAddr,
    closed: AtomicBool,
}

/// Cloneable reference to a live allocation.
#[derive(Clone)]
pub struct AllocationHandle {
    shared: Arc<Shared>,
}

impl AllocationHandle {
    /// Public address peers dial to reach the gateway.
    pub fn relayed_addr(&self) -> SocketAddr {
        self.shared.relayed
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Permit traffic from `peer` (`host:port`, port `0` = any port).
    pub async fn create_permission(&self, peer: &str) -> GatewayResult<()> {
        let addr = tokio::net::lookup_host(peer)
            .await
            .map_err(|e| GatewayError::Allocation(format!("cannot resolve peer {peer}: {e}")))?
            .next()
            .ok_or_else(|| GatewayError::Allocation(format!("peer {peer} resolved to nothing")))?;
        self.shared.client.create_permission(addr).await
    }

    /// Delete the allocation on the relay and stop the control connection.
    ///
    /// Only the first call does anything.
    pub async fn close(&self) -> GatewayResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.shared.client.refresh(0).await.map(|_| ());
        self.shared.client.shutdown();
        match &result {
            Ok(()) => info!(relayed = %self.shared.relayed, "relay allocation released"),
            Err(e) => debug!(error = %e, "relay deallocation failed"),
        }
        result
    }
}

/// Relayed peer connections for one allocation.
pub struct TcpAllocation {
    handle: AllocationHandle,
    incoming: mpsc::Receiver<Incoming>,
    refresher: JoinHandle<()>,
}

impl TcpAllocation {
    /// Dial the relay, authenticate and request a TCP allocation.
    pub async fn open(
        credentials: &RelayCredentials,
        timings: &SessionTimings,
    ) -> GatewayResult<Self> {
        let dialer = RelayDialer::new(&credentials.server_address, timings.relay_dial_timeout)?;
        info!(
            relay = %dialer.address(),
            tls = dialer.uses_tls(),
            "connecting to relay"
        );
        let (client, incoming) =
            TurnClient::connect(dialer, credentials.clone(), timings.turn_transaction_timeout)
                .await?;
        let (relayed, lifetime) = client.allocate_tcp().await?;
        let errors = client.incoming_sender();

        let handle = AllocationHandle {
            shared: Arc::new(Shared {
                client,
                relayed,
                closed: AtomicBool::new(false),
            }),
        };
        let refresher = tokio::spawn(refresh_loop(handle.clone(), lifetime, errors));

        Ok(Self {
            handle,
            incoming,
            refresher,
        })
    }

    pub fn handle(&self) -> AllocationHandle {
        self.handle.clone()
    }

    pub fn relayed_addr(&self) -> SocketAddr {
        self.handle.relayed_addr()
    }
}

impl Drop for TcpAllocation {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

impl RawListener for TcpAllocation {
    type Stream = RelayStream;

    async fn accept(&mut self) -> GatewayResult<(RelayStream, SocketAddr)> {
        if self.handle.is_closed() {
            return Err(GatewayError::AllocationClosed("allocation released".into()));
        }
        match self.incoming.recv().await {
            Some(incoming) => incoming,
            None => Err(GatewayError::AllocationClosed(
                "relay connection stream ended".into(),
            )),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.handle.relayed_addr()
    }
}

/// Refresh at half the granted lifetime until the allocation is closed.
/// A failed refresh is reported as fatal on the incoming channel.
async fn refresh_loop(handle: AllocationHandle, mut lifetime: u32, errors: mpsc::Sender<Incoming>) {
    loop {
        let wait = Duration::from_secs(u64::from(lifetime / 2).max(1));
        tokio::time::sleep(wait).await;
        if handle.is_closed() {
            return;
        }
        match handle.shared.client.refresh(DEFAULT_LIFETIME_SECS).await {
            Ok(granted) => {
                debug!(lifetime = granted, "relay allocation refreshed");
                lifetime = granted;
            }
            Err(e) => {
                if handle.is_closed() {
                    return;
                }
                warn!(error = %e, "relay allocation refresh failed");
                let _ = errors
                    .send(Err(GatewayError::Allocation(format!("refresh failed: {e}"))))
                    .await;
                return;
            }
        }
    }
}
