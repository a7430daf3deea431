//! HTTP client for the proctoring backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use super::error::{RemoteError, RemoteResult};
use super::types::{
    DEFAULT_BLOCK_REASON, ErrorBody, SecurityLogEntry, ValidationRequest, ValidationResult,
};
use super::{SessionApi, Validator};
use crate::proxy::ProxyConfig;

const AUTH_ROUTE: &str = "/proxy/auth-http/";
const VALIDATE_ROUTE: &str = "/proxy/validate/";
const DISCONNECT_ROUTE: &str = "/proxy/disconnect-http/";
const START_MONITORING_ROUTE: &str = "/proxy/start-monitoring/";
const STOP_MONITORING_ROUTE: &str = "/proxy/stop-monitoring/";
const SECURITY_LOG_ROUTE: &str = "/events/api/logging/http-request";

/// Reason used when the authority answered with a non-success status.
pub const VALIDATION_ERROR_REASON: &str = "Validation error";
/// Reason used when the authority could not be reached.
pub const UNREACHABLE_REASON: &str = "No connection to server";

/// Client for the remote policy authority.
///
/// Every call authenticates with the session's event key as a bearer token.
#[derive(Debug, Clone)]
pub struct PolicyClient {
    client: Client,
    base_url: Url,
}

impl PolicyClient {
    /// Create a client for the API rooted at `base_url`.
    pub fn new(base_url: Url, timeout: Duration) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("proctor-proxy/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, base_url })
    }

    /// Base URL used for session calls.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Verify the event key with the authority.
    ///
    /// A rejection carries the authority's `error` message when the body is
    /// JSON, or the raw body text otherwise.
    pub async fn authenticate(&self, event_key: &str) -> RemoteResult<()> {
        debug!("Authenticating event key");

        match self.post(&self.base_url, AUTH_ROUTE, event_key, None::<&()>).await {
            Err(RemoteError::Status { message, .. }) => Err(RemoteError::Authentication(message)),
            other => other.map(|_| ()),
        }
    }

    /// Ask the authority whether a request may pass.
    ///
    /// Unlike [`Validator::validate`], failures are returned as errors.
    pub async fn check_request(
        &self,
        api_base_url: &Url,
        event_key: &str,
        request: &ValidationRequest,
    ) -> RemoteResult<ValidationResult> {
        let response = self
            .post(api_base_url, VALIDATE_ROUTE, event_key, Some(request))
            .await?;
        let body = response.text().await?;
        let mut result: ValidationResult = serde_json::from_str(&body)?;

        if result.blocked && result.reason.is_none() {
            result.reason = Some(DEFAULT_BLOCK_REASON.to_string());
        }
        Ok(result)
    }

    /// Tell the authority the session ended.
    pub async fn disconnect(&self, event_key: &str) -> RemoteResult<()> {
        self.post(&self.base_url, DISCONNECT_ROUTE, event_key, None::<&()>)
            .await
            .map(|_| ())
    }

    /// Ask the authority to switch monitoring on for the session.
    pub async fn start_monitoring(&self, event_key: &str) -> RemoteResult<()> {
        self.post(&self.base_url, START_MONITORING_ROUTE, event_key, None::<&()>)
            .await
            .map(|_| ())
    }

    /// Ask the authority to switch monitoring off for the session.
    pub async fn stop_monitoring(&self, event_key: &str) -> RemoteResult<()> {
        self.post(&self.base_url, STOP_MONITORING_ROUTE, event_key, None::<&()>)
            .await
            .map(|_| ())
    }

    /// Record a security incident with the authority.
    pub async fn log_security_event(
        &self,
        event_key: &str,
        entry: &SecurityLogEntry,
    ) -> RemoteResult<()> {
        self.post(&self.base_url, SECURITY_LOG_ROUTE, event_key, Some(entry))
            .await
            .map(|_| ())
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        base: &Url,
        route: &str,
        event_key: &str,
        body: Option<&B>,
    ) -> RemoteResult<Response> {
        let url = endpoint(base, route)?;

        let mut request = self.client.post(url).bearer_auth(event_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = error_message(response).await;
        debug!("{} answered {}: {}", route, status, message);
        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

/// Join a route onto the API base, keeping any path prefix of the base.
fn endpoint(base: &Url, route: &str) -> RemoteResult<Url> {
    let joined = format!("{}{}", base.as_str().trim_end_matches('/'), route);
    Ok(Url::parse(&joined)?)
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    if let Some(error) = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.error)
    {
        return error;
    }
    if !text.trim().is_empty() {
        return text;
    }
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}

#[async_trait]
impl Validator for PolicyClient {
    async fn validate(&self, config: &ProxyConfig, request: &ValidationRequest) -> ValidationResult {
        match self
            .check_request(&config.api_base_url, &config.event_key, request)
            .await
        {
            Ok(result) => result,
            Err(e @ (RemoteError::Status { .. } | RemoteError::Decode(_))) => {
                warn!("Validation of {} {} failed: {}", request.method, request.url, e);
                ValidationResult::blocked(VALIDATION_ERROR_REASON)
            }
            Err(e) => {
                warn!("Validation server unreachable for {}: {}", request.url, e);
                ValidationResult::blocked(UNREACHABLE_REASON)
            }
        }
    }
}

#[async_trait]
impl SessionApi for PolicyClient {
    async fn authenticate(&self, event_key: &str) -> RemoteResult<()> {
        PolicyClient::authenticate(self, event_key).await
    }

    async fn disconnect(&self, event_key: &str) -> RemoteResult<()> {
        PolicyClient::disconnect(self, event_key).await
    }

    async fn start_monitoring(&self, event_key: &str) -> RemoteResult<()> {
        PolicyClient::start_monitoring(self, event_key).await
    }

    async fn stop_monitoring(&self, event_key: &str) -> RemoteResult<()> {
        PolicyClient::stop_monitoring(self, event_key).await
    }

    async fn log_security_event(
        &self,
        event_key: &str,
        entry: &SecurityLogEntry,
    ) -> RemoteResult<()> {
        PolicyClient::log_security_event(self, event_key, entry).await
    }
}
