use thiserror::Error;
use super::types::{UploadId, UploadStatus};

/// Errors returned by the manager and the stores.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error {0}")]
    Config(#[from] toml::de::Error),

    #[error("Upload {0} not found")]
    NotFound(UploadId),

    #[error("Cannot {action} upload in state {status:?}")]
    InvalidState {
        action: &'static str,
        status: UploadStatus,
    },

    #[error("Upload request has no context id")]
    MissingContext,

    #[error("Storage usage {percentage:.1}% is above the {threshold:.1}% warning threshold")]
    QuotaWarning {
        percentage: f64,
        threshold: f64,
    },

    #[error("Upload {0} for the same file is still queued")]
    DuplicateQueued(UploadId),

    #[error("The same batch is already being queued")]
    BatchInFlight,

    #[error("Payload {0} not found in store")]
    PayloadMissing(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Manager shutdown")]
    ManagerShutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    pub fn invalid_state(action: &'static str, status: UploadStatus) -> Self {
        Self::InvalidState { action, status }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }
}

/// Failures reported by the network transfer and the registration collaborators.
///
/// Kept `Clone` so an outcome can be logged, classified and stored without
/// re-running the call that produced it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: status code {status}, message: {message}")]
    Http {
        status: u16,
        message: String,
    },

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid upload: {0}")]
    Validation(String),

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl TransferError {
    /// Maps a non-success HTTP status. 413 and 507 are the quota signals.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            413 | 507 => Self::QuotaExceeded(message),
            _ => Self::Http { status, message },
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Self::Network(err.to_string());
        }

        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }

        if err.is_decode() {
            return Self::Other(format!("Invalid response body: {}", err));
        }

        Self::Network(err.to_string())
    }
}

/// Error alias
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
