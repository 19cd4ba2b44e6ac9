//! Peer identity from a client leaf certificate and the attribute allow-list
//! applied to it.
//!
//! Authorization is two fixed comparisons on the certificate Subject: the
//! first OrganizationalUnit must be [`CLIENT_ROLE_MARKER`] and the first
//! CommonName must be [`TRUSTED_ORIGIN_MARKER`]. It is a minimal trust model,
//! not a policy engine.

use crate::error::{GatewayError, GatewayResult};
use std::fmt;
use x509_parser::prelude::*;

/// Expected Subject OU of a client allowed through the gateway.
pub const CLIENT_ROLE_MARKER: &str = "gateway-client";
/// Expected Subject CN of a client allowed through the gateway.
pub const TRUSTED_ORIGIN_MARKER: &str = "cloud";

/// Identity attributes read from a peer's leaf certificate at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub organizational_unit: Option<String>,
    pub common_name: Option<String>,
}

impl PeerIdentity {
    /// Parse the Subject of a DER-encoded certificate.
    pub fn from_der(der: &[u8]) -> GatewayResult<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| GatewayError::Certificate(format!("cannot parse peer certificate: {e}")))?;
        let subject = cert.subject();

        let organizational_unit = subject
            .iter_organizational_unit()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string);
        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string);

        Ok(Self {
            organizational_unit,
            common_name,
        })
    }

    pub fn is_authorized(&self) -> bool {
        self.organizational_unit.as_deref() == Some(CLIENT_ROLE_MARKER)
            && self.common_name.as_deref() == Some(TRUSTED_ORIGIN_MARKER)
    }

    /// `Ok(())` when the allow-list matches, [`GatewayError::Unauthorized`] otherwise.
    pub fn authorize(&self) -> GatewayResult<()> {
        if self.is_authorized() {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized(format!(
                "client certificate verification failed, received {self}"
            )))
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OU={}, CN={}",
            self.organizational_unit.as_deref().unwrap_or("<none>"),
            self.common_name.as_deref().unwrap_or("<none>")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn cert_der(ou: Option<&str>, cn: Option<&str>) -> Vec<u8> {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        if let Some(ou) = ou {
            params
                .distinguished_name
                .push(DnType::OrganizationalUnitName, ou);
        }
        if let Some(cn) = cn {
            params.distinguished_name.push(DnType::CommonName, cn);
        }
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    #[test]
    fn trusted_client_is_authorized() {
        let id = PeerIdentity::from_der(&cert_der(Some("gateway-client"), Some("cloud"))).unwrap();
        assert_eq!(id.organizational_unit.as_deref(), Some("gateway-client"));
        assert_eq!(id.common_name.as_deref(), Some("cloud"));
        assert!(id.authorize().is_ok());
    }

    #[test]
    fn wrong_role_is_rejected() {
        let id = PeerIdentity::from_der(&cert_der(Some("unknown"), Some("cloud"))).unwrap();
        let err = id.authorize().unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));
        assert!(err.to_string().contains("OU=unknown"));
    }

    #[test]
    fn wrong_origin_is_rejected() {
        let id = PeerIdentity::from_der(&cert_der(Some("gateway-client"), Some("laptop"))).unwrap();
        assert!(!id.is_authorized());
    }

    #[test]
    fn missing_attributes_are_rejected() {
        let id = PeerIdentity::from_der(&cert_der(None, Some("cloud"))).unwrap();
        assert_eq!(id.organizational_unit, None);
        assert!(!id.is_authorized());
        assert_eq!(id.to_string(), "OU=<none>, CN=cloud");
    }

    #[test]
    fn garbage_der_is_a_certificate_error() {
        let err = PeerIdentity::from_der(b"not a certificate").unwrap_err();
        assert!(matches!(err, GatewayError::Certificate(_)));
    }
}
