//! Control-plane wire types (JSON, camelCase).

use serde::{Deserialize, Serialize};

pub const REGISTER_IDENTITY_PATH: &str = "/api/v1/gateways/register-identity";
pub const EXCHANGE_CERT_PATH: &str = "/api/v1/gateways/exchange-cert";
pub const HEARTBEAT_PATH: &str = "/api/v1/gateways/heartbeat";

/// Response to `RegisterGatewayIdentity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterIdentityResponse {
    pub turn_server_address: String,
    pub turn_server_username: String,
    pub turn_server_password: String,
    #[serde(default)]
    pub turn_server_realm: String,
    #[serde(default)]
    pub static_egress_address: Option<String>,
}

/// Request body for `ExchangeRelayCertificate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeCertRequest {
    pub relay_address: String,
}

/// Response to `ExchangeRelayCertificate`. All PEM encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeCertResponse {
    pub serial_number: String,
    pub private_key: String,
    pub certificate: String,
    pub certificate_chain: String,
}

impl std::fmt::Debug for ExchangeCertResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCertResponse")
            .field("serial_number", &self.serial_number)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}
