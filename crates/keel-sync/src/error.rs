//! Error types for sync operations

use std::time::Duration;

use keel_core::{CryptoError, ErrorKind, StorageError};
use thiserror::Error;

/// Errors that can occur while pushing or pulling seeds and vaults
#[derive(Debug, Error)]
pub enum SyncError {
    /// A transport call did not finish within its budget
    #[error("Transport '{backend}' timed out after {after:?} during {op}")]
    TransportTimeout {
        backend: String,
        op: &'static str,
        after: Duration,
    },

    /// Backend is unreachable or refused the operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// Git operation failed
    #[error("Git error: {0}")]
    Git(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Sender is not a known key
    #[error("Unknown sender: {0}")]
    UnknownSender(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Restore could not be applied and was rolled back
    #[error("Partial restore rolled back: {0}")]
    PartialRestore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid blob name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SyncError {
    /// Taxonomy kind for rejection records, when there is one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::TransportTimeout { .. } => Some(ErrorKind::TransportTimeout),
            Self::Crypto(e) => Some(e.kind()),
            Self::UnknownSender(_) => Some(ErrorKind::UnknownIssuer),
            Self::Malformed(_) => Some(ErrorKind::MalformedPayload),
            Self::PartialRestore(_) => Some(ErrorKind::PartialRestore),
            _ => None,
        }
    }

    /// Transport failures may succeed on retry; anything wrong with the
    /// artifact itself will not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportTimeout { .. } | Self::Transport(_) | Self::Git(_)
        )
    }

    /// Whether the artifact being processed should be quarantined
    pub fn is_artifact_fault(&self) -> bool {
        matches!(
            self,
            Self::Crypto(_) | Self::UnknownSender(_) | Self::Malformed(_)
        )
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
