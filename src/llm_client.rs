//! Provider-neutral model client interface.
//!
//! The engine depends only on this shape: one streaming call that yields
//! text deltas, reasoning deltas, and a final usage report.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;

use crate::models::{ModelInputItem, Usage};

/// One event of a streamed model response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// End of the response with the provider-reported usage.
    Finish(Usage),
}

pub type StreamEventBox = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Per-request knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_output_tokens: crate::models::DEFAULT_OUTPUT_TOKENS,
            temperature: None,
        }
    }
}

/// Typed model-client failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LlmError {
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("authentication failed: {0}")]
    AuthenticationError(String),
    #[error("invalid request (HTTP {status}): {message}")]
    InvalidRequest { status: u16, message: String },
    #[error("stream error: {0}")]
    StreamError(String),
}

impl LlmError {
    /// Map an unsuccessful HTTP status and body to a typed error.
    #[must_use]
    pub fn from_http_response(status: u16, body: &str) -> Self {
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body.trim().to_string()
        };
        match status {
            401 | 403 => LlmError::AuthenticationError(message),
            429 => LlmError::RateLimited {
                message,
                retry_after: None,
            },
            500..=599 => LlmError::ServerError { status, message },
            _ => LlmError::InvalidRequest { status, message },
        }
    }

    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. }
                | LlmError::ServerError { .. }
                | LlmError::NetworkError(_)
                | LlmError::Timeout(_)
        )
    }

    /// HTTP status carried by the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::RateLimited { .. } => Some(429),
            LlmError::ServerError { status, .. } | LlmError::InvalidRequest { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return LlmError::Timeout(Duration::ZERO);
        }
        if let Some(status) = err.status() {
            return LlmError::from_http_response(status.as_u16(), &err.to_string());
        }
        LlmError::NetworkError(err.to_string())
    }
}

/// A streaming model backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Identifier recorded on assistant messages.
    fn model_id(&self) -> &str;

    async fn send(
        &self,
        input: &[ModelInputItem],
        system: &str,
        options: &RequestOptions,
    ) -> Result<StreamEventBox, LlmError>;
}
