//! Session-scoped values: relay credentials, the issued certificate bundle,
//! and the lifecycle state of one gateway session.
//!
//! A [`GatewaySession`] is assembled once every field is known and is never
//! mutated afterwards. The running session owns it; lifecycle tasks take
//! copies of the few fields they need.

use crate::api::{ExchangeCertResponse, RegisterIdentityResponse};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Credentials for the TURN relay, as issued at registration.
#[derive(Clone, PartialEq, Eq)]
pub struct RelayCredentials {
    /// `host:port` of the relay server.
    pub server_address: String,
    pub username: String,
    pub password: String,
    pub realm: String,
}

impl fmt::Debug for RelayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayCredentials")
            .field("server_address", &self.server_address)
            .field("username", &self.username)
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

/// Everything learned from `RegisterGatewayIdentity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRegistration {
    pub credentials: RelayCredentials,
    /// Peer address whose relay permission is kept alive, port `0` = any port.
    pub static_egress: Option<String>,
}

impl From<RegisterIdentityResponse> for RelayRegistration {
    fn from(resp: RegisterIdentityResponse) -> Self {
        Self {
            static_egress: resp
                .static_egress_address
                .as_deref()
                .and_then(normalize_egress_address),
            credentials: RelayCredentials {
                server_address: resp.turn_server_address,
                username: resp.turn_server_username,
                password: resp.turn_server_password,
                realm: resp.turn_server_realm,
            },
        }
    }
}

/// Normalize a static egress address for use as a permission target.
///
/// Empty input yields `None`. An address without an explicit port gets port
/// `0`, meaning any port.
pub fn normalize_egress_address(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.parse::<SocketAddr>().is_ok() {
        return Some(raw.to_string());
    }
    let bare = raw.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, 0).to_string());
    }
    if raw.contains(':') {
        Some(raw.to_string())
    } else {
        Some(format!("{raw}:0"))
    }
}

/// Ephemeral mTLS identity issued for one session. All fields PEM.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub serial_number: String,
    pub private_key: String,
    pub certificate: String,
    pub certificate_chain: String,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("serial_number", &self.serial_number)
            .finish_non_exhaustive()
    }
}

impl From<ExchangeCertResponse> for CertificateBundle {
    fn from(resp: ExchangeCertResponse) -> Self {
        Self {
            serial_number: resp.serial_number,
            private_key: resp.private_key,
            certificate: resp.certificate,
            certificate_chain: resp.certificate_chain,
        }
    }
}

/// Immutable configuration of one running session.
#[derive(Debug, Clone)]
pub struct GatewaySession {
    registration: RelayRegistration,
    relay_address: SocketAddr,
    certificate: CertificateBundle,
}

impl GatewaySession {
    pub fn new(
        registration: RelayRegistration,
        relay_address: SocketAddr,
        certificate: CertificateBundle,
    ) -> Self {
        Self {
            registration,
            relay_address,
            certificate,
        }
    }

    pub fn credentials(&self) -> &RelayCredentials {
        &self.registration.credentials
    }

    pub fn static_egress(&self) -> Option<&str> {
        self.registration.static_egress.as_deref()
    }

    /// Public endpoint allocated on the relay.
    pub fn relay_address(&self) -> SocketAddr {
        self.relay_address
    }

    pub fn certificate(&self) -> &CertificateBundle {
        &self.certificate
    }
}

/// Lifecycle of one gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registering,
    Allocating,
    ExchangingCertificate,
    Listening,
    Draining,
    Closed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if next == Closed {
            return self != Closed;
        }
        matches!(
            (self, next),
            (Unregistered, Registering)
                | (Registering, Allocating)
                | (Allocating, ExchangingCertificate)
                | (ExchangingCertificate, Listening)
                | (Listening, Draining)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unregistered => "unregistered",
            SessionState::Registering => "registering",
            SessionState::Allocating => "allocating",
            SessionState::ExchangingCertificate => "exchanging-certificate",
            SessionState::Listening => "listening",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
