//! Control-plane client: registration, certificate exchange and heartbeats
//! over HTTP with a bearer token.

use relaygate_core::api::{
    ExchangeCertRequest, ExchangeCertResponse, RegisterIdentityResponse, EXCHANGE_CERT_PATH,
    HEARTBEAT_PATH, REGISTER_IDENTITY_PATH,
};
use relaygate_core::{CertificateBundle, GatewayError, GatewayResult, RelayRegistration};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Boxed future returned by [`ControlPlane`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The three control-plane operations a gateway session depends on.
///
/// Object-safe so a session can hold `Arc<dyn ControlPlane>` and tests can
/// substitute an in-memory implementation.
pub trait ControlPlane: Send + Sync {
    fn register_identity(&self) -> BoxFuture<'_, GatewayResult<RelayRegistration>>;

    fn exchange_certificate(
        &self,
        relay_address: SocketAddr,
    ) -> BoxFuture<'_, GatewayResult<CertificateBundle>>;

    fn heartbeat(&self) -> BoxFuture<'_, GatewayResult<()>>;
}

/// HTTP implementation of [`ControlPlane`].
pub struct HttpControlPlane {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relaygate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::ControlPlane(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: Option<&ExchangeCertRequest>) -> GatewayResult<reqwest::Response> {
        let url = self.url(path);
        debug!(url = %url, "control plane request");

        let mut req = self.http.post(&url).bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req
            .send()
            .await
            .map_err(|e| GatewayError::ControlPlane(format!("{path}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::ControlPlane(format!(
                "{path} returned {status}: {}",
                body.trim()
            )));
        }
        Ok(response)
    }
}

impl ControlPlane for HttpControlPlane {
    fn register_identity(&self) -> BoxFuture<'_, GatewayResult<RelayRegistration>> {
        Box::pin(async move {
            let resp: RegisterIdentityResponse = self
                .post(REGISTER_IDENTITY_PATH, None)
                .await?
                .json()
                .await
                .map_err(|e| GatewayError::ControlPlane(format!("invalid registration: {e}")))?;
            Ok(RelayRegistration::from(resp))
        })
    }

    fn exchange_certificate(
        &self,
        relay_address: SocketAddr,
    ) -> BoxFuture<'_, GatewayResult<CertificateBundle>> {
        Box::pin(async move {
            let request = ExchangeCertRequest {
                relay_address: relay_address.to_string(),
            };
            let resp: ExchangeCertResponse = self
                .post(EXCHANGE_CERT_PATH, Some(&request))
                .await?
                .json()
                .await
                .map_err(|e| {
                    GatewayError::Certificate(format!("invalid certificate exchange response: {e}"))
                })?;
            Ok(CertificateBundle::from(resp))
        })
    }

    fn heartbeat(&self) -> BoxFuture<'_, GatewayResult<()>> {
        Box::pin(async move {
            self.post(HEARTBEAT_PATH, None)
                .await
                .map(|_| ())
                .map_err(|e| GatewayError::Heartbeat(e.to_string()))
        })
    }
}
