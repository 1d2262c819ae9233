//! Outbound HTTP transport
//!
//! The pipeline talks to the remote endpoint through the `Transport` trait
//! so tests can inject a scripted double. Status classification is a
//! closed set handled exhaustively by the queue manager.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RelayError, Result};
use crate::types::Fingerprint;

/// Classified result of one transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    /// 2xx
    Success,
    /// Timeout, connection error, 408, 429, 5xx
    Transient(String),
    /// Any other 4xx: retrying the unchanged request cannot succeed
    Permanent(String),
}

/// Blocking-style call contract against the remote endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ship a whole-file payload
    async fn upload(
        &self,
        path: &Path,
        content: Vec<u8>,
        fingerprint: &Fingerprint,
    ) -> Result<TransportStatus>;

    /// Tell the remote the file is gone
    async fn delete(&self, path: &Path) -> Result<TransportStatus>;

    /// Startup reachability probe; logged but never fatal
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Production transport over reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RelayError::Http)?;
        Ok(Self { client, endpoint })
    }

    fn classify(status: reqwest::StatusCode) -> TransportStatus {
        if status.is_success() {
            TransportStatus::Success
        } else if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            TransportStatus::Transient(format!("HTTP {}", status.as_u16()))
        } else if status.is_client_error() {
            TransportStatus::Permanent(format!("HTTP {}", status.as_u16()))
        } else {
            // 3xx without auto-follow, 1xx: nothing actionable, retry
            TransportStatus::Transient(format!("HTTP {}", status.as_u16()))
        }
    }

    fn classify_send_error(e: reqwest::Error) -> TransportStatus {
        TransportStatus::Transient(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(
        &self,
        path: &Path,
        content: Vec<u8>,
        fingerprint: &Fingerprint,
    ) -> Result<TransportStatus> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        let part = reqwest::multipart::Part::bytes(content).file_name(file_name);
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("path", path.display().to_string())
            .text("fingerprint", fingerprint.to_string());

        let url = format!("{}/files", self.endpoint.trim_end_matches('/'));
        match self.client.post(&url).multipart(form).send().await {
            Ok(response) => Ok(Self::classify(response.status())),
            Err(e) => Ok(Self::classify_send_error(e)),
        }
    }

    async fn delete(&self, path: &Path) -> Result<TransportStatus> {
        let url = format!("{}/files", self.endpoint.trim_end_matches('/'));
        let body = serde_json::json!({ "path": path.display().to_string() });
        match self.client.delete(&url).json(&body).send().await {
            Ok(response) => Ok(Self::classify(response.status())),
            Err(e) => Ok(Self::classify_send_error(e)),
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.endpoint.trim_end_matches('/'));
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!("Health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn classification_table() {
        assert_eq!(
            HttpTransport::classify(StatusCode::OK),
            TransportStatus::Success
        );
        assert_eq!(
            HttpTransport::classify(StatusCode::CREATED),
            TransportStatus::Success
        );
        assert!(matches!(
            HttpTransport::classify(StatusCode::INTERNAL_SERVER_ERROR),
            TransportStatus::Transient(_)
        ));
        assert!(matches!(
            HttpTransport::classify(StatusCode::SERVICE_UNAVAILABLE),
            TransportStatus::Transient(_)
        ));
        assert!(matches!(
            HttpTransport::classify(StatusCode::TOO_MANY_REQUESTS),
            TransportStatus::Transient(_)
        ));
        assert!(matches!(
            HttpTransport::classify(StatusCode::REQUEST_TIMEOUT),
            TransportStatus::Transient(_)
        ));
        assert!(matches!(
            HttpTransport::classify(StatusCode::BAD_REQUEST),
            TransportStatus::Permanent(_)
        ));
        assert!(matches!(
            HttpTransport::classify(StatusCode::UNAUTHORIZED),
            TransportStatus::Permanent(_)
        ));
        assert!(matches!(
            HttpTransport::classify(StatusCode::NOT_FOUND),
            TransportStatus::Permanent(_)
        ));
    }
}
