//! Resilient egress to the inference service.
//!
//! Every embedding or analysis request goes through an [`Orchestrator`], which
//! layers a per-attempt timeout, retry with exponential backoff, and a
//! [`CircuitBreaker`] shared by every worker that talks to the same endpoint.
pub mod breaker;
pub mod orchestrator;
pub mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use orchestrator::{Endpoints, Orchestrator};
pub use retry::RetryPolicy;

use thiserror::Error;

/// Errors surfaced by calls to an inference endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("circuit breaker is open for {endpoint}")]
    CircuitOpen { endpoint: String },
}

impl ServiceError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// Timeouts, connection failures, 5xx and 429 are transient. Everything
    /// else describes a request that will fail the same way again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connection(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else if e.is_decode() {
            Self::MalformedResponse(e.to_string())
        } else if e.is_builder() {
            Self::InvalidInput(e.to_string())
        } else {
            Self::Connection(e.to_string())
        }
    }
}
