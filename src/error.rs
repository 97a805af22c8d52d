//! Relay error taxonomy
//!
//! Every failure the hub or the receiver client can report is one of the
//! variants below. The client keeps retrying network-level failures and
//! credential rejections; the rest describe a request that will fail the
//! same way again.

use thiserror::Error;

use crate::hub::ReceiverId;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Rejected at the transport boundary before any relay semantics apply.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// Missing or malformed registration. No record was created.
    #[error("registration failed: {0}")]
    RegistrationFailure(String),

    /// Administrator or unregister action on an unknown id, or on one the
    /// caller does not own.
    #[error("receiver not found: {0}")]
    NotFound(String),

    /// The subscriber's transport went away.
    #[error("transport lost: {0}")]
    TransportLoss(String),

    /// Local OSC forward could not be sent.
    #[error("forward failed: {0}")]
    ForwardFailure(String),

    /// Value cannot be expressed as an OSC packet.
    #[error("osc encode error: {0}")]
    Encode(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl RelayError {
    pub fn not_found(id: &ReceiverId) -> Self {
        RelayError::NotFound(id.to_string())
    }

    /// Category used by the client to decide whether to keep retrying.
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::Auth(_) => ErrorCategory::Auth,
            RelayError::RegistrationFailure(_) | RelayError::NotFound(_) => {
                ErrorCategory::Validation
            }
            RelayError::TransportLoss(_) | RelayError::WebSocket(_) | RelayError::Io(_) => {
                ErrorCategory::Network
            }
            RelayError::ForwardFailure(_) => ErrorCategory::Forward,
            RelayError::Encode(_) | RelayError::Json(_) => ErrorCategory::Protocol,
            RelayError::Config(_) => ErrorCategory::Configuration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Categorized error types for better handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Credential rejected by the hub
    Auth,

    /// Connection refused, dropped, or timed out (retryable)
    Network,

    /// Bad request content (not retryable)
    Validation,

    /// Wire-format problems
    Protocol,

    /// Local OSC forward problems (never fatal)
    Forward,

    /// Configuration errors (not retryable)
    Configuration,
}

impl ErrorCategory {
    /// Network failures and credential rejections are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Network | ErrorCategory::Auth)
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
