//! Error classification for the provider endpoint.
//!
//! The core only cares which side of the external-failure split a response
//! lands on: rate limiting (429) and server faults (5xx, including 529
//! overload) are transient and retried internally, while any other 4xx
//! means the request itself is unacceptable and the task fails without
//! retry. Transport failures count as transient.

use reqwest::StatusCode;
use thiserror::Error;

/// Failure talking to the provider, pre-classified for the retry loop.
#[derive(Error, Debug, Clone)]
pub enum LlmApiError {
    /// Rate limiting or a server-side fault; another attempt may succeed
    #[error("provider busy ({status}): {body}")]
    Retryable { status: StatusCode, body: String },

    /// The request itself was refused (auth, schema, unknown model);
    /// retrying cannot help
    #[error("provider rejected request ({status}): {body}")]
    Rejected { status: StatusCode, body: String },

    /// No usable response at all: connect failure or mid-flight timeout
    #[error("provider unreachable: {0}")]
    Unreachable(String),
}

impl LlmApiError {
    /// Sort a non-success status onto the transient/terminal axis.
    pub fn classify(status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Retryable { status, body }
        } else {
            Self::Rejected { status, body }
        }
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }

    /// HTTP status, when one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Retryable { status, .. } | Self::Rejected { status, .. } => Some(*status),
            Self::Unreachable(_) => None,
        }
    }
}
