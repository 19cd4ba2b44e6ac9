use thiserror::Error;

/// Errors produced by the relay gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("control plane error: {0}")]
    ControlPlane(String),

    #[error("relay connection failed: {0}")]
    RelayConnect(String),

    #[error("relay allocation failed: {0}")]
    Allocation(String),

    #[error("relay allocation closed: {0}")]
    AllocationClosed(String),

    #[error("TURN {method} request failed with {code}: {reason}")]
    TurnRequest {
        method: &'static str,
        code: u16,
        reason: String,
    },

    #[error("malformed STUN/TURN frame: {0}")]
    MalformedFrame(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("peer not authorized: {0}")]
    Unauthorized(String),

    #[error("heartbeat failed: {0}")]
    Heartbeat(String),

    #[error("relay unreachable: {0}")]
    RelayUnreachable(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Relay-protocol noise inherent to multiplexed TURN traffic. Never logged.
    pub fn is_frame_noise(&self) -> bool {
        matches!(self, GatewayError::MalformedFrame(_))
    }

    /// Allocation-level failures after which no further connection can arrive.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::AllocationClosed(_) | GatewayError::Allocation(_)
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
