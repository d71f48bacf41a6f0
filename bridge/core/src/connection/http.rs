//! HTTP platform transport
//!
//! Talks JSON to a platform endpoint:
//!
//! | Operation      | Request                                   |
//! |----------------|-------------------------------------------|
//! | connect        | `GET  {endpoint}/health`                  |
//! | heartbeat      | `GET  {endpoint}/health`                  |
//! | send           | `POST {endpoint}/v1/agent`                |
//! | sync_context   | `POST {endpoint}/v1/sessions/{id}/context`|

use std::time::Duration;

use async_trait::async_trait;

use super::transport::{PlatformReply, PlatformRequest, PlatformTransport, TransportError};
use crate::session::Session;

/// Maximum number of body bytes kept in error messages
const MAX_ERROR_BODY: usize = 512;

/// JSON-over-HTTP transport for one platform
#[derive(Clone)]
pub struct HttpTransport {
    /// Base URL without trailing slash
    endpoint: String,
    /// Timeout for health probes
    probe_timeout: Duration,
    /// HTTP client
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport for `endpoint`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(
        endpoint: impl Into<String>,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(format!("http client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            probe_timeout,
            http_client,
        })
    }

    /// Base URL of the platform
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.endpoint)
    }

    fn agent_url(&self) -> String {
        format!("{}/v1/agent", self.endpoint)
    }

    fn context_url(&self, session: &Session) -> String {
        format!("{}/v1/sessions/{}/context", self.endpoint, session.id)
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let response = self
            .http_client
            .get(self.health_url())
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl PlatformTransport for HttpTransport {
    fn kind(&self) -> &str {
        "http"
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.probe().await
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        self.probe().await
    }

    async fn send(&self, request: &PlatformRequest) -> Result<PlatformReply, TransportError> {
        let response = self
            .http_client
            .post(self.agent_url())
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let response = check_status(response).await?;
        response
            .json::<PlatformReply>()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn sync_context(&self, session: &Session) -> Result<(), TransportError> {
        let response = self
            .http_client
            .post(self.context_url(session))
            .json(session)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        check_status(response).await.map(|_| ())
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_decode() {
        TransportError::Protocol(error.to_string())
    } else {
        TransportError::Unreachable(error.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(TransportError::Status {
        code: status.as_u16(),
        body,
    })
}
