//! Periodic background tasks that run alongside the listener: control-plane
//! heartbeat, relay permission refresh for the static egress peer, and relay
//! liveness probing.
//!
//! All three stop on the session shutdown signal. Heartbeat and probe
//! failures are fatal and go to the shared [`ErrorSink`]; permission refresh
//! is best effort.

use crate::config::SessionTimings;
use crate::control_plane::ControlPlane;
use crate::relay::AllocationHandle;
use relaygate_core::{GatewayError, GatewayResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const ERROR_CHANNEL_CAPACITY: usize = 8;

/// Fan-in point for fatal errors from every session task.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<GatewayError>,
    shutdown: CancellationToken,
}

impl ErrorSink {
    pub fn channel(shutdown: CancellationToken) -> (Self, mpsc::Receiver<GatewayError>) {
        let (tx, rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        (Self { tx, shutdown }, rx)
    }

    /// Deliver `err`, unless shutdown is already under way.
    pub async fn report(&self, err: GatewayError) {
        tokio::select! {
            _ = self.tx.send(err) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

fn ticker(first: Duration, period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Call `beat` after `initial_delay`, then every `period`. The first failure
/// is reported and ends the loop.
pub async fn heartbeat_loop<F, Fut>(
    beat: F,
    initial_delay: Duration,
    period: Duration,
    sink: ErrorSink,
    shutdown: CancellationToken,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = GatewayResult<()>>,
{
    let mut ticks = ticker(initial_delay, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticks.tick() => {}
        }
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = beat() => result,
        };
        match result {
            Ok(()) => debug!("heartbeat acknowledged"),
            Err(e) => {
                error!(error = %e, "heartbeat failed");
                sink.report(e).await;
                return;
            }
        }
    }
}

/// Re-create the relay permission immediately, then every `period`.
/// Failures are logged at debug and otherwise ignored.
pub async fn permission_refresh_loop<F, Fut>(refresh: F, period: Duration, shutdown: CancellationToken)
where
    F: Fn() -> Fut,
    Fut: Future<Output = GatewayResult<()>>,
{
    let mut ticks = ticker(Duration::ZERO, period);
    let mut established = false;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticks.tick() => {}
        }
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = refresh() => result,
        };
        match result {
            Ok(()) if !established => {
                info!("relay permission established");
                established = true;
            }
            Ok(()) => {}
            Err(e) => debug!(error = %e, "relay permission refresh failed"),
        }
    }
}

/// Run `probe` after `initial_delay`, then every `period`. The first failure
/// is reported as [`GatewayError::RelayUnreachable`] and ends the loop.
pub async fn liveness_probe_loop<F, Fut>(
    probe: F,
    initial_delay: Duration,
    period: Duration,
    sink: ErrorSink,
    shutdown: CancellationToken,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = GatewayResult<()>>,
{
    let mut ticks = ticker(initial_delay, period);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticks.tick() => {}
        }
        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = probe() => result,
        };
        if let Err(e) = result {
            error!(error = %e, "relay liveness probe failed");
            sink.report(GatewayError::RelayUnreachable(e.to_string())).await;
            return;
        }
        debug!("relay liveness probe ok");
    }
}

/// Open a TCP connection to `addr` and close it straight away.
pub async fn probe_relay(addr: SocketAddr, timeout: Duration) -> GatewayResult<()> {
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr))
        .await
        .map_err(|_| GatewayError::RelayUnreachable(format!("dial {addr} timed out")))??;
    drop(stream);
    Ok(())
}

/// The three lifecycle tasks of one session.
pub struct LifecycleTasks {
    tasks: JoinSet<()>,
}

impl LifecycleTasks {
    pub fn spawn(
        control_plane: Arc<dyn ControlPlane>,
        allocation: AllocationHandle,
        static_egress: Option<String>,
        timings: SessionTimings,
        sink: ErrorSink,
        shutdown: CancellationToken,
    ) -> Self {
        let mut tasks = JoinSet::new();

        tasks.spawn(heartbeat_loop(
            move || {
                let control_plane = control_plane.clone();
                async move { control_plane.heartbeat().await }
            },
            timings.heartbeat_initial_delay,
            timings.heartbeat_interval,
            sink.clone(),
            shutdown.clone(),
        ));

        match static_egress {
            Some(peer) => {
                let allocation = allocation.clone();
                tasks.spawn(permission_refresh_loop(
                    move || {
                        let allocation = allocation.clone();
                        let peer = peer.clone();
                        async move { allocation.create_permission(&peer).await }
                    },
                    timings.permission_refresh_interval,
                    shutdown.clone(),
                ));
            }
            None => debug!("no static egress address, permission refresh disabled"),
        }

        let relayed = allocation.relayed_addr();
        let dial_timeout = timings.relay_dial_timeout;
        tasks.spawn(liveness_probe_loop(
            move || probe_relay(relayed, dial_timeout),
            timings.probe_initial_delay,
            timings.probe_interval,
            sink,
            shutdown,
        ));

        Self { tasks }
    }

    /// Wait for every task to observe shutdown.
    pub async fn join(mut self) {
        while self.tasks.join_next().await.is_some() {}
    }
}
