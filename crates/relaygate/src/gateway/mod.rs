//! Gateway session orchestration.
//!
//! A session registers with the control plane, allocates a TCP endpoint on
//! the relay, exchanges the relayed address for an mTLS identity and then
//! serves verified connections until the parent token is cancelled or a
//! fatal error reaches the shared error channel.
//!
//! # Submodules
//!
//! - **[`listener`]**: [`SecureListener`] wraps a [`RawListener`](listener::RawListener) (the relay
//!   allocation) with TLS, client-certificate verification and the
//!   OU/CN authorization check.
//! - **[`dispatcher`]**: [`Dispatcher`] runs one task per verified
//!   connection and drains them on shutdown.
//! - **[`lifecycle`]**: heartbeat, permission refresh and liveness probe,
//!   all reporting into one [`ErrorSink`](lifecycle::ErrorSink).
//! - **[`forwarder`]**: [`TcpForwardHandler`], the default
//!   [`ConnectionHandler`].
//!
//! # Teardown
//!
//! ```text
//! parent cancelled / fatal error
//!   → shutdown token cancelled (accept loop, connections, lifecycle tasks)
//!   → drain in-flight connections for the grace period, abort the rest
//!   → release the relay allocation (once)
//! ```

pub mod dispatcher;
pub mod forwarder;
pub mod lifecycle;
pub mod listener;
#[cfg(test)]
mod testing;

pub use forwarder::TcpForwardHandler;

use dispatcher::{ConnectionHandler, Dispatcher};
use listener::SecureListener;

use crate::config::SessionTimings;
use crate::control_plane::ControlPlane;
use crate::relay::{AllocationHandle, TcpAllocation};
use lifecycle::{ErrorSink, LifecycleTasks};
use relaygate_core::{GatewayError, GatewayResult, GatewaySession, RelayRegistration, SessionState};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The parent token was cancelled.
    Cancelled,
    /// A fatal error ended the session.
    Failed {
        error: GatewayError,
        /// Whether the session got as far as serving connections.
        reached_listening: bool,
    },
}

/// A fully set up session, ready to serve.
struct Established {
    session: GatewaySession,
    listener: SecureListener<TcpAllocation>,
    allocation: AllocationHandle,
}

pub struct Gateway {
    control_plane: Arc<dyn ControlPlane>,
    timings: SessionTimings,
    max_connections: Option<usize>,
    state: watch::Sender<SessionState>,
}

impl Gateway {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        timings: SessionTimings,
        max_connections: Option<usize>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Unregistered);
        Self {
            control_plane,
            timings,
            max_connections,
            state,
        }
    }

    /// Current lifecycle state of the most recent session.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state transitions as they happen.
    #[cfg(test)]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if !previous.can_transition_to(next) {
            warn!(from = %previous, to = %next, "unexpected session state transition");
        }
        info!(from = %previous, to = %next, "session state changed");
    }

    /// Run one session to completion. Always ends in [`SessionState::Closed`].
    pub async fn run_session<H: ConnectionHandler>(
        &self,
        parent: &CancellationToken,
        handler: Arc<H>,
    ) -> SessionOutcome {
        self.state.send_replace(SessionState::Unregistered);
        let outcome = match self.establish(parent).await {
            Ok(established) => self.serve(parent, established, handler).await,
            Err(outcome) => outcome,
        };
        self.transition(SessionState::Closed);
        outcome
    }

    async fn establish(&self, parent: &CancellationToken) -> Result<Established, SessionOutcome> {
        let registration: RelayRegistration = self
            .stage(parent, SessionState::Registering, self.control_plane.register_identity())
            .await?;
        info!(
            relay = %registration.credentials.server_address,
            static_egress = registration.static_egress.as_deref().unwrap_or("none"),
            "gateway identity registered"
        );

        let allocation = self
            .stage(
                parent,
                SessionState::Allocating,
                TcpAllocation::open(&registration.credentials, &self.timings),
            )
            .await?;
        let handle = allocation.handle();
        let relayed = allocation.relayed_addr();
        info!(relayed = %relayed, "relay allocation ready");

        let bundle = match self
            .stage(
                parent,
                SessionState::ExchangingCertificate,
                self.control_plane.exchange_certificate(relayed),
            )
            .await
        {
            Ok(bundle) => bundle,
            Err(outcome) => {
                let _ = handle.close().await;
                return Err(outcome);
            }
        };
        info!(serial = %bundle.serial_number, "session certificate issued");

        let session = GatewaySession::new(registration, relayed, bundle);
        let listener = match SecureListener::new(allocation, session.certificate(), self.timings) {
            Ok(listener) => listener,
            Err(e) => {
                error!(stage = %SessionState::ExchangingCertificate, error = %e, "session setup failed");
                let _ = handle.close().await;
                return Err(SessionOutcome::Failed {
                    error: e,
                    reached_listening: false,
                });
            }
        };

        Ok(Established {
            session,
            listener,
            allocation: handle,
        })
    }

    /// Enter `state` and run `work`, giving up early if `parent` is cancelled.
    async fn stage<T>(
        &self,
        parent: &CancellationToken,
        state: SessionState,
        work: impl Future<Output = GatewayResult<T>>,
    ) -> Result<T, SessionOutcome> {
        self.transition(state);
        tokio::select! {
            biased;
            _ = parent.cancelled() => Err(SessionOutcome::Cancelled),
            result = work => result.map_err(|error| {
                error!(stage = %state, error = %error, "session setup failed");
                SessionOutcome::Failed { error, reached_listening: false }
            }),
        }
    }

    async fn serve<H: ConnectionHandler>(
        &self,
        parent: &CancellationToken,
        established: Established,
        handler: Arc<H>,
    ) -> SessionOutcome {
        let Established {
            session,
            listener,
            allocation,
        } = established;

        self.transition(SessionState::Listening);
        info!(relayed = %session.relay_address(), "gateway listening");

        let shutdown = parent.child_token();
        let (sink, mut errors) = ErrorSink::channel(shutdown.clone());
        let lifecycle = LifecycleTasks::spawn(
            self.control_plane.clone(),
            allocation.clone(),
            session.static_egress().map(str::to_owned),
            self.timings,
            sink.clone(),
            shutdown.clone(),
        );
        let dispatcher = Dispatcher::new(handler, shutdown.clone(), self.max_connections);
        let accept_loop = tokio::spawn(listener.run(dispatcher, shutdown.clone(), sink));

        let fatal = tokio::select! {
            _ = parent.cancelled() => None,
            err = errors.recv() => Some(err.unwrap_or_else(|| {
                GatewayError::Other("session tasks ended unexpectedly".into())
            })),
        };
        match &fatal {
            Some(e) => error!(error = %e, "fatal session error, shutting down"),
            None => info!("shutdown requested"),
        }

        self.transition(SessionState::Draining);
        shutdown.cancel();
        match accept_loop.await {
            Ok(mut dispatcher) => {
                let report = dispatcher.drain(self.timings.grace_period).await;
                info!(
                    completed = report.completed,
                    aborted = report.aborted,
                    "connections drained"
                );
            }
            Err(e) => error!(error = %e, "accept loop task failed"),
        }
        lifecycle.join().await;
        let _ = allocation.close().await;

        match fatal {
            Some(error) => SessionOutcome::Failed {
                error,
                reached_listening: true,
            },
            None => SessionOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::dispatcher::PeerContext;
    use crate::control_plane::BoxFuture;
    use crate::relay::testing::FakeTurnServer;
    use relaygate_core::CertificateBundle;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use super::testing::TestPki;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::TlsConnector;

    struct MockControlPlane {
        registration: Option<RelayRegistration>,
        bundle: Option<CertificateBundle>,
        heartbeat_ok: bool,
        heartbeats: AtomicUsize,
        exchanged: Mutex<Vec<SocketAddr>>,
    }

    impl MockControlPlane {
        fn new(turn: &FakeTurnServer, pki: &TestPki) -> Self {
            Self {
                registration: Some(RelayRegistration {
                    credentials: turn.credentials(),
                    static_egress: Some("127.0.0.1:0".into()),
                }),
                bundle: Some(pki.gateway_bundle()),
                heartbeat_ok: true,
                heartbeats: AtomicUsize::new(0),
                exchanged: Mutex::new(Vec::new()),
            }
        }
    }

    impl ControlPlane for MockControlPlane {
        fn register_identity(&self) -> BoxFuture<'_, GatewayResult<RelayRegistration>> {
            let result = self
                .registration
                .clone()
                .ok_or_else(|| GatewayError::ControlPlane("401 unauthorized".into()));
            Box::pin(async move { result })
        }

        fn exchange_certificate(
            &self,
            relay_address: SocketAddr,
        ) -> BoxFuture<'_, GatewayResult<CertificateBundle>> {
            self.exchanged.lock().unwrap().push(relay_address);
            let result = self
                .bundle
                .clone()
                .ok_or_else(|| GatewayError::ControlPlane("500 internal error".into()));
            Box::pin(async move { result })
        }

        fn heartbeat(&self) -> BoxFuture<'_, GatewayResult<()>> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            let ok = self.heartbeat_ok;
            Box::pin(async move {
                if ok {
                    Ok(())
                } else {
                    Err(GatewayError::Heartbeat("503 service unavailable".into()))
                }
            })
        }
    }

    /// Greets, then echoes until the peer hangs up.
    struct Greeter;

    impl ConnectionHandler for Greeter {
        async fn handle<S>(&self, mut stream: S, _peer: PeerContext) -> GatewayResult<()>
        where
            S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        {
            stream.write_all(b"welcome").await?;
            stream.flush().await?;
            let mut buf = [0u8; 64];
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                stream.write_all(&buf[..n]).await?;
            }
        }
    }

    fn quiet_timings() -> SessionTimings {
        SessionTimings {
            accept_poll: Duration::from_millis(50),
            handshake_timeout: Duration::from_secs(2),
            grace_period: Duration::from_secs(1),
            heartbeat_initial_delay: Duration::from_secs(3600),
            probe_initial_delay: Duration::from_secs(3600),
            relay_dial_timeout: Duration::from_secs(2),
            turn_transaction_timeout: Duration::from_secs(2),
            ..SessionTimings::default()
        }
    }

    async fn wait_for_state(gateway: &Gateway, wanted: SessionState) {
        let mut states = gateway.subscribe();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn session_serves_authorized_client_then_closes() {
        let turn = FakeTurnServer::start().await;
        let pki = TestPki::new();
        let control = Arc::new(MockControlPlane::new(&turn, &pki));
        let gateway = Arc::new(Gateway::new(control.clone(), quiet_timings(), None));
        let parent = CancellationToken::new();

        let session = {
            let gateway = gateway.clone();
            let parent = parent.clone();
            tokio::spawn(async move { gateway.run_session(&parent, Arc::new(Greeter)).await })
        };
        wait_for_state(&gateway, SessionState::Listening).await;
        assert_eq!(
            control.exchanged.lock().unwrap().as_slice(),
            &[turn.relayed_address()]
        );

        let tcp = TcpStream::connect(turn.relayed_address()).await.unwrap();
        let connector = TlsConnector::from(pki.client_config("gateway-client", "cloud"));
        let mut client = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"welcome");
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // The egress permission is created as soon as the session listens.
        tokio::time::timeout(Duration::from_secs(5), async {
            while turn.log().await.permissions.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        parent.cancel();
        let outcome = session.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Cancelled));
        assert_eq!(gateway.state(), SessionState::Closed);

        let log = turn.log().await;
        assert_eq!(log.allocations, 1);
        assert_eq!(log.binds, 1);
        assert_eq!(log.refreshes.iter().filter(|&&l| l == 0).count(), 1);
        assert_eq!(control.heartbeats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn heartbeat_failure_ends_session() {
        let turn = FakeTurnServer::start().await;
        let pki = TestPki::new();
        let control = Arc::new(MockControlPlane {
            heartbeat_ok: false,
            ..MockControlPlane::new(&turn, &pki)
        });
        let timings = SessionTimings {
            heartbeat_initial_delay: Duration::from_millis(100),
            ..quiet_timings()
        };
        let gateway = Gateway::new(control.clone(), timings, None);

        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            gateway.run_session(&CancellationToken::new(), Arc::new(Greeter)),
        )
        .await
        .unwrap();

        match outcome {
            SessionOutcome::Failed {
                error: GatewayError::Heartbeat(_),
                reached_listening: true,
            } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(gateway.state(), SessionState::Closed);
        assert_eq!(control.heartbeats.load(Ordering::SeqCst), 1);
        assert!(turn.log().await.refreshes.contains(&0));
    }

    #[tokio::test]
    async fn certificate_failure_releases_allocation() {
        let turn = FakeTurnServer::start().await;
        let pki = TestPki::new();
        let control = Arc::new(MockControlPlane {
            bundle: None,
            ..MockControlPlane::new(&turn, &pki)
        });
        let gateway = Gateway::new(control, quiet_timings(), None);

        let outcome = gateway
            .run_session(&CancellationToken::new(), Arc::new(Greeter))
            .await;
        assert!(matches!(
            outcome,
            SessionOutcome::Failed {
                error: GatewayError::ControlPlane(_),
                reached_listening: false,
            }
        ));

        let log = turn.log().await;
        assert_eq!(log.allocations, 1);
        assert_eq!(log.refreshes, vec![0]);
        assert_eq!(gateway.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn registration_failure_never_touches_relay() {
        let turn = FakeTurnServer::start().await;
        let pki = TestPki::new();
        let control = Arc::new(MockControlPlane {
            registration: None,
            ..MockControlPlane::new(&turn, &pki)
        });
        let gateway = Gateway::new(control, quiet_timings(), None);

        let outcome = gateway
            .run_session(&CancellationToken::new(), Arc::new(Greeter))
            .await;
        assert!(matches!(
            outcome,
            SessionOutcome::Failed {
                reached_listening: false,
                ..
            }
        ));
        assert_eq!(turn.log().await.allocations, 0);
    }

    #[tokio::test]
    async fn lost_relay_connection_is_fatal() {
        let turn = FakeTurnServer::start().await;
        let pki = TestPki::new();
        let control = Arc::new(MockControlPlane::new(&turn, &pki));
        let gateway = Arc::new(Gateway::new(control, quiet_timings(), None));

        let session = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .run_session(&CancellationToken::new(), Arc::new(Greeter))
                    .await
            })
        };
        wait_for_state(&gateway, SessionState::Listening).await;
        turn.drop_allocations();

        let outcome = tokio::time::timeout(Duration::from_secs(10), session)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Failed {
                error: GatewayError::AllocationClosed(_),
                reached_listening: true,
            }
        ));
        assert_eq!(gateway.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn cancellation_during_setup_is_not_an_error() {
        let turn = FakeTurnServer::start().await;
        let pki = TestPki::new();
        let gateway = Gateway::new(
            Arc::new(MockControlPlane::new(&turn, &pki)),
            quiet_timings(),
            None,
        );
        let parent = CancellationToken::new();
        parent.cancel();

        let outcome = gateway.run_session(&parent, Arc::new(Greeter)).await;
        assert!(matches!(outcome, SessionOutcome::Cancelled));
        assert_eq!(gateway.state(), SessionState::Closed);
    }
}
