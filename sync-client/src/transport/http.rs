//! HttpTransport - push and pull over HTTP with MessagePack bodies.

use super::sse::ChangeListener;
use super::{Transport, TransportError};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use std::time::Duration;
use sync_core::RetryPolicy;
use sync_types::{
    decode, encode, DeviceId, PullRequest, PullResponse, PushRequest, PushResponse,
    StatusResponse, SyncError, CONTENT_TYPE_MSGPACK,
};

/// Configuration for HttpTransport.
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Server base URL, e.g. `https://sync.example.com`.
    pub base_url: String,
    /// Bearer token issued by the authentication layer.
    pub token: String,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Push/pull request timeout.
    pub request_timeout: Duration,
}

impl HttpTransportConfig {
    /// Configuration with default timeouts.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HttpTransport implements the Transport trait against the sync server API.
///
/// # Example
///
/// ```ignore
/// let transport = HttpTransport::new(HttpTransportConfig::new("http://localhost:8080", token))?;
/// let response = transport.push(request).await?;
/// ```
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    /// Create a new HttpTransport.
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        // No overall timeout on the client: the change stream is long-lived.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::ConnectionFailed(format!("failed to build client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Server base URL.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_msgpack(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.config.token)
            .header(CONTENT_TYPE, CONTENT_TYPE_MSGPACK)
            .header(ACCEPT, CONTENT_TYPE_MSGPACK)
            .timeout(self.config.request_timeout)
            .body(body)
            .send()
            .await
            .map_err(map_send_error)?;

        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(map_body_error)?;
        Ok(bytes.to_vec())
    }

    /// Fetch the read-only family status.
    pub async fn status(&self) -> Result<StatusResponse, TransportError> {
        let response = self
            .client
            .get(self.url("/v1/status"))
            .bearer_auth(&self.config.token)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(map_send_error)?;

        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(map_body_error)?;
        serde_json::from_slice(&bytes).map_err(|e| TransportError::Codec(SyncError::Json(e)))
    }

    /// Build a listener for this device's change stream.
    pub fn listener(&self, device_id: DeviceId, retry: RetryPolicy) -> ChangeListener {
        ChangeListener::new(
            self.client.clone(),
            self.url("/v1/stream"),
            self.config.token.clone(),
            device_id,
            retry,
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        let body = encode(&request).map_err(TransportError::Codec)?;
        tracing::debug!("POST /v1/push ({} events, {} bytes)", request.events.len(), body.len());

        let bytes = self.post_msgpack("/v1/push", body).await?;
        decode(&bytes).map_err(TransportError::Codec)
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        let body = encode(&request).map_err(TransportError::Codec)?;
        tracing::debug!("POST /v1/pull (since={}, limit={})", request.since, request.limit);

        let bytes = self.post_msgpack("/v1/pull", body).await?;
        decode(&bytes).map_err(TransportError::Codec)
    }
}

pub(super) fn map_send_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::ConnectionFailed(err.to_string())
    }
}

fn map_body_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Closed
    }
}

pub(super) async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(TransportError::Unauthorized);
    }
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response)
}
