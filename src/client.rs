//! Runtime protocol client — the outbound half of the wire protocol.
//!
//! The client issues the four protocol calls against a control plane,
//! validates the responses, and classifies failures. It keeps a pooled
//! connection to the control plane and never retries: a non-matching
//! status or a classified transport failure is surfaced as-is, and any
//! retry policy belongs to the poll loop driving this client.
//!
//! # Error classification
//!
//! - transport timeout → `RuntimeApiError::Upstream("timeout")`
//! - connection reset → `RuntimeApiError::Upstream("connectionResetByPeer")`
//! - any other transport error → passed through unchanged
//! - unexpected HTTP status → `RuntimeApiError::BadStatusCode`

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RuntimeApiError, RuntimeApiResult};
use crate::protocol::{
    API_VERSION, ERROR_TYPE_UNHANDLED, HEADER_ERROR_TYPE, Invocation, InvocationOutcome,
    USER_AGENT,
};

/// Classification string for a transport-level timeout.
const UPSTREAM_TIMEOUT: &str = "timeout";
/// Classification string for a connection reset by the control plane.
const UPSTREAM_CONNECTION_RESET: &str = "connectionResetByPeer";

/// Configuration for the runtime protocol client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the control plane (e.g. "http://127.0.0.1:9001").
    pub endpoint: String,
    /// Request timeout (connection + response). Enforced by the transport;
    /// the client only classifies the resulting error.
    pub timeout: Duration,
    /// Connection timeout (TCP handshake).
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    /// Create a config with the given endpoint and default timeouts.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `AWS_LAMBDA_RUNTIME_API` (required): control plane address as
    ///   `host:port`, prefixed with `http://` if no scheme is given
    /// - `RUNTIME_API_TIMEOUT_SECS` (default: 30): request timeout
    /// - `RUNTIME_API_CONNECT_TIMEOUT_SECS` (default: 5): connect timeout
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeApiError::Upstream`] if `AWS_LAMBDA_RUNTIME_API`
    /// is not set.
    pub fn from_env() -> RuntimeApiResult<Self> {
        let address = std::env::var("AWS_LAMBDA_RUNTIME_API")
            .map_err(|_| RuntimeApiError::Upstream("AWS_LAMBDA_RUNTIME_API not set"))?;
        let endpoint = if address.starts_with("http://") || address.starts_with("https://") {
            address
        } else {
            format!("http://{address}")
        };

        let timeout_secs: u64 = std::env::var("RUNTIME_API_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let connect_timeout_secs: u64 = std::env::var("RUNTIME_API_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        Ok(Self {
            endpoint,
            timeout: Duration::from_secs(timeout_secs),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
        })
    }
}

/// Runtime protocol client.
///
/// # Thread Safety
///
/// The client is `Clone` and can be shared across tasks; the underlying
/// reqwest client pools connections internally. In the steady-state
/// protocol a single poll loop owns one client and has at most one call
/// outstanding.
#[derive(Clone)]
pub struct RuntimeClient {
    client: Client,
    config: ClientConfig,
    cancel: CancellationToken,
}

impl RuntimeClient {
    /// Create a new client against the configured control plane.
    ///
    /// # Errors
    ///
    /// Returns the underlying builder error if the HTTP client cannot be
    /// constructed.
    pub fn new(config: ClientConfig) -> RuntimeApiResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Get a reference to the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Abort any outstanding call.
    ///
    /// Teardown-only: once cancelled, the in-flight call and every
    /// subsequent call resolve to [`RuntimeApiError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Poll the control plane for the next invocation.
    ///
    /// Succeeds only on status 200 with a non-empty body and all four
    /// required invocation headers present.
    ///
    /// # Errors
    ///
    /// - [`RuntimeApiError::BadStatusCode`] for any non-200 status
    /// - [`RuntimeApiError::NoBody`] if the body is empty
    /// - [`RuntimeApiError::InvocationMissingHeader`] for a missing or
    ///   malformed required header
    /// - classified transport failures as described in the module docs
    pub async fn next_invocation(&self) -> RuntimeApiResult<(Invocation, Bytes)> {
        let url = self.url(&format!("/{API_VERSION}/runtime/invocation/next"));
        debug!(url = %url, "polling for next invocation");

        let response = self.execute(self.client.get(&url)).await?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!(status = status.as_u16(), "next-invocation returned unexpected status");
            return Err(RuntimeApiError::BadStatusCode(status.as_u16()));
        }

        let invocation = Invocation::from_headers(response.headers())?;
        let body = self.collect_body(response).await?;
        if body.is_empty() {
            return Err(RuntimeApiError::NoBody);
        }

        debug!(
            request_id = %invocation.request_id,
            deadline_epoch_ms = invocation.deadline_epoch_ms,
            payload_bytes = body.len(),
            "received invocation"
        );
        Ok((invocation, body))
    }

    /// Report the outcome of an invocation.
    ///
    /// A success posts the payload bytes (empty allowed) to the response
    /// path; a failure posts the JSON error payload to the error path with
    /// the unhandled-error header set. Both succeed only on status 202.
    pub async fn report_result(
        &self,
        invocation: &Invocation,
        outcome: InvocationOutcome,
    ) -> RuntimeApiResult<()> {
        match outcome {
            InvocationOutcome::Success(payload) => {
                let url = self.url(&format!(
                    "/{API_VERSION}/runtime/invocation/{}/response",
                    invocation.request_id
                ));
                debug!(request_id = %invocation.request_id, url = %url, "reporting result");

                let request = self
                    .client
                    .post(&url)
                    .body(payload.unwrap_or_default());
                let response = self.execute(request).await?;
                self.expect_accepted(response)
            }
            InvocationOutcome::Failure(error) => {
                let url = self.url(&format!(
                    "/{API_VERSION}/runtime/invocation/{}/error",
                    invocation.request_id
                ));
                debug!(request_id = %invocation.request_id, url = %url, "reporting error");

                let response = self.post_error_payload(&url, &error).await?;
                self.expect_accepted(response)
            }
        }
    }

    /// Report a failure that occurred before any invocation was received.
    ///
    /// Succeeds only on status 202.
    pub async fn report_init_error(
        &self,
        error: &crate::protocol::FunctionError,
    ) -> RuntimeApiResult<()> {
        let url = self.url(&format!("/{API_VERSION}/runtime/init/error"));
        debug!(url = %url, "reporting initialization error");

        let response = self.post_error_payload(&url, error).await?;
        self.expect_accepted(response)
    }

    async fn post_error_payload(
        &self,
        url: &str,
        error: &crate::protocol::FunctionError,
    ) -> RuntimeApiResult<reqwest::Response> {
        let payload = error.to_error_response();
        let request = self
            .client
            .post(url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(HEADER_ERROR_TYPE, ERROR_TYPE_UNHANDLED)
            .json(&payload);
        self.execute(request).await
    }

    fn expect_accepted(&self, response: reqwest::Response) -> RuntimeApiResult<()> {
        let status = response.status();
        if status != StatusCode::ACCEPTED {
            warn!(status = status.as_u16(), "report returned unexpected status");
            return Err(RuntimeApiError::BadStatusCode(status.as_u16()));
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.endpoint.trim_end_matches('/'))
    }

    /// Send a request, racing it against cancellation, and classify any
    /// transport failure.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> RuntimeApiResult<reqwest::Response> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RuntimeApiError::Cancelled),
            result = request.send() => result.map_err(classify_transport),
        }
    }

    /// Collect the response body, racing it against cancellation.
    async fn collect_body(&self, response: reqwest::Response) -> RuntimeApiResult<Bytes> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RuntimeApiError::Cancelled),
            result = response.bytes() => result.map_err(classify_transport),
        }
    }
}

/// Classify a transport error into the stable upstream set.
///
/// Timeouts and connection resets get fixed descriptions; everything else
/// propagates unchanged.
fn classify_transport(error: reqwest::Error) -> RuntimeApiError {
    if error.is_timeout() {
        warn!("control-plane request timed out");
        return RuntimeApiError::Upstream(UPSTREAM_TIMEOUT);
    }

    if source_io_kind(&error) == Some(std::io::ErrorKind::ConnectionReset) {
        warn!("control-plane connection reset by peer");
        return RuntimeApiError::Upstream(UPSTREAM_CONNECTION_RESET);
    }

    RuntimeApiError::Transport(error)
}

/// Walk the source chain looking for the underlying I/O error kind.
fn source_io_kind(error: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = error.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = err.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert!(config.endpoint.is_empty());
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn config_with_endpoint() {
        let config = ClientConfig::with_endpoint("http://127.0.0.1:9001");
        assert_eq!(config.endpoint, "http://127.0.0.1:9001");
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn config_from_env_missing_endpoint() {
        // SAFETY: serialized test, env mutation is isolated
        unsafe {
            std::env::remove_var("AWS_LAMBDA_RUNTIME_API");
        }

        assert!(ClientConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn config_from_env_prefixes_scheme() {
        // SAFETY: serialized test, env mutation is isolated
        unsafe {
            std::env::set_var("AWS_LAMBDA_RUNTIME_API", "127.0.0.1:9001");
            std::env::set_var("RUNTIME_API_TIMEOUT_SECS", "7");
        }

        let config = ClientConfig::from_env().expect("endpoint set");
        assert_eq!(config.endpoint, "http://127.0.0.1:9001");
        assert_eq!(config.timeout, Duration::from_secs(7));

        // SAFETY: cleanup of the vars set above
        unsafe {
            std::env::remove_var("AWS_LAMBDA_RUNTIME_API");
            std::env::remove_var("RUNTIME_API_TIMEOUT_SECS");
        }
    }

    #[test]
    fn client_creation_keeps_config() {
        let client = RuntimeClient::new(ClientConfig::with_endpoint("http://127.0.0.1:9001"))
            .expect("client builds");
        assert_eq!(client.config().endpoint, "http://127.0.0.1:9001");
        assert_eq!(client.config().timeout, Duration::from_secs(30));
    }

    /// Stand-in for the transport's layered errors: a wrapper whose source
    /// chain bottoms out in an `io::Error`, the shape reqwest produces for
    /// socket-level faults.
    #[derive(Debug)]
    struct Layered(std::io::Error);

    impl std::fmt::Display for Layered {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "transport layer: {}", self.0)
        }
    }

    impl std::error::Error for Layered {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn source_chain_walk_finds_connection_reset() {
        let error = Layered(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(
            source_io_kind(&error),
            Some(std::io::ErrorKind::ConnectionReset)
        );
    }

    #[test]
    fn source_chain_walk_without_io_error_finds_nothing() {
        let error = RuntimeApiError::NoBody;
        assert_eq!(source_io_kind(&error), None);
    }

    #[tokio::test]
    async fn cancelled_client_fails_fast() {
        let client = RuntimeClient::new(ClientConfig::with_endpoint("http://127.0.0.1:9001"))
            .expect("client builds");
        client.cancel();
        let err = client.next_invocation().await.expect_err("cancelled");
        assert!(matches!(err, RuntimeApiError::Cancelled));
    }
}
