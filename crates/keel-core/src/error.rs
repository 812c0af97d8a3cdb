//! Error types and the shared rejection taxonomy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::token::Capability;

/// Stable, serializable error taxonomy.
///
/// Every rejected artifact (token, seed, vault) is recorded with one of these
/// kinds so that audits can tell a forged payload from a misaddressed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidSignature,
    UnknownIssuer,
    Expired,
    NotYetValid,
    Revoked,
    CapabilityDenied,
    MalformedPayload,
    DecryptionFailed,
    TransportTimeout,
    PartialRestore,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSignature => "invalid_signature",
            Self::UnknownIssuer => "unknown_issuer",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::Revoked => "revoked",
            Self::CapabilityDenied => "capability_denied",
            Self::MalformedPayload => "malformed_payload",
            Self::DecryptionFailed => "decryption_failed",
            Self::TransportTimeout => "transport_timeout",
            Self::PartialRestore => "partial_restore",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from signing, verification and envelope encryption
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Signature does not verify (forged or tampered payload)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Envelope cannot be opened with the local key (wrong recipient or corrupted)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Envelope has no recipients")]
    NoRecipients,

    /// Key bytes are not a valid public or private key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl CryptoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSignature(_) => ErrorKind::InvalidSignature,
            Self::DecryptionFailed(_) | Self::NoRecipients => ErrorKind::DecryptionFailed,
            Self::InvalidKey(_) | Self::MalformedPayload(_) => ErrorKind::MalformedPayload,
        }
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedPayload(e.to_string())
    }
}

/// Storage errors shared by every persisted store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store {path}: {detail}")]
    Corrupt { path: String, detail: String },
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Token authorization errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid signature on token {token_id}: {detail}")]
    InvalidSignature { token_id: String, detail: String },

    #[error("Unknown issuer: {0}")]
    UnknownIssuer(String),

    #[error("Token {token_id} expired at {expired_at}")]
    Expired {
        token_id: String,
        expired_at: DateTime<Utc>,
    },

    #[error("Token {token_id} not valid before {not_before}")]
    NotYetValid {
        token_id: String,
        not_before: DateTime<Utc>,
    },

    #[error("Token revoked: {0}")]
    Revoked(String),

    #[error("Capability denied: {capability}")]
    CapabilityDenied { capability: Capability },

    #[error("Malformed token: {0}")]
    MalformedPayload(String),

    #[error("A token must grant at least one capability")]
    InvalidCapabilities,

    #[error("Token not found: {0}")]
    TokenNotFound(String),

    #[error("Ambiguous token id prefix: {0}")]
    AmbiguousTokenId(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AuthError {
    /// Taxonomy kind, if this error is an authorization verdict rather than
    /// a usage or storage failure.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::InvalidSignature { .. } => Some(ErrorKind::InvalidSignature),
            Self::UnknownIssuer(_) => Some(ErrorKind::UnknownIssuer),
            Self::Expired { .. } => Some(ErrorKind::Expired),
            Self::NotYetValid { .. } => Some(ErrorKind::NotYetValid),
            Self::Revoked(_) => Some(ErrorKind::Revoked),
            Self::CapabilityDenied { .. } => Some(ErrorKind::CapabilityDenied),
            Self::MalformedPayload(_) => Some(ErrorKind::MalformedPayload),
            Self::InvalidCapabilities
            | Self::TokenNotFound(_)
            | Self::AmbiguousTokenId(_)
            | Self::Storage(_) => None,
        }
    }
}
