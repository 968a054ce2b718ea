//! Client for the solving backend's HTTP endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("solver responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("solver did not respond within {0:?}")]
    Timeout(Duration),
    #[error("solver request failed: {0}")]
    Transport(String),
}

/// Synchronous request/response call into the solving tier.
#[async_trait]
pub trait SolverBackend: Send + Sync {
    /// Forward a raw job document, returning the response body on success.
    async fn solve(&self, payload: &[u8]) -> Result<Vec<u8>, BackendError>;

    fn name(&self) -> &str;
}

pub struct HttpSolverBackend {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpSolverBackend {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SolverBackend for HttpSolverBackend {
    async fn solve(&self, payload: &[u8]) -> Result<Vec<u8>, BackendError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout(self.timeout)
                } else {
                    BackendError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::Timeout(self.timeout)
            } else {
                BackendError::Transport(e.to_string())
            }
        })?;
        debug!("Solver answered HTTP {} with {} bytes", status, body.len());

        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    fn name(&self) -> &str {
        &self.url
    }
}
