//! relaygate-core: shared protocol library for the relay gateway.
//!
//! Provides the STUN/TURN message codec and TCP stream framing,
//! control-plane wire types, session values, peer identity extraction, and
//! the common error type.

pub mod api;
pub mod codec;
pub mod error;
pub mod identity;
pub mod session;
pub mod stun;

// Re-export commonly used items at crate root.
pub use codec::{Frame, StunFrameDecoder};
pub use error::{GatewayError, GatewayResult};
pub use identity::{PeerIdentity, CLIENT_ROLE_MARKER, TRUSTED_ORIGIN_MARKER};
pub use session::{
    normalize_egress_address, CertificateBundle, GatewaySession, RelayCredentials,
    RelayRegistration, SessionState,
};
