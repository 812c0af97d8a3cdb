//! Pluggable byte transport between devices
//!
//! A transport moves opaque, already-sealed blobs. It knows nothing about
//! seeds or vaults: it only keeps four namespaces per device.
//!
//! - `outbox`: blobs this device produced
//! - `inbox`: blobs surfaced from peers, waiting to be processed
//! - `archive`: processed blobs, keyed by name for replay detection
//! - `rejected`: quarantined blobs plus a `<name>.reason.json` record

use std::fmt::{self, Debug};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::ErrorKind;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Outbox,
    Inbox,
    Archive,
    Rejected,
}

impl Namespace {
    pub const ALL: [Namespace; 4] = [Self::Outbox, Self::Inbox, Self::Archive, Self::Rejected];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outbox => "outbox",
            Self::Inbox => "inbox",
            Self::Archive => "archive",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a blob was quarantined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    pub name: String,
    pub kind: ErrorKind,
    pub detail: String,
    pub rejected_at: DateTime<Utc>,
}

/// Trait for transport backends
///
/// Implementations must never expose a partially written blob under its
/// final name, and `archive` must be safe to call for a name that is
/// already archived (it drops the duplicate inbox copy).
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Check if backend is reachable and writable
    async fn is_healthy(&self) -> bool;

    async fn put_outbox(&self, name: &str, bytes: &[u8]) -> Result<(), SyncError>;

    /// Names of blobs waiting in the inbox, sorted
    async fn list_inbox(&self) -> Result<Vec<String>, SyncError>;

    async fn get_inbox(&self, name: &str) -> Result<Vec<u8>, SyncError>;

    /// Move an inbox blob to the archive
    async fn archive(&self, name: &str) -> Result<(), SyncError>;

    /// Move an inbox blob to the rejected namespace with its reason
    async fn reject(&self, name: &str, record: &RejectionRecord) -> Result<(), SyncError>;

    async fn is_archived(&self, name: &str) -> Result<bool, SyncError>;

    /// Names of blobs in any namespace, sorted
    async fn list_namespace(&self, namespace: Namespace) -> Result<Vec<String>, SyncError>;
}

/// Run a transport operation under a deadline
pub async fn bounded<T, F>(backend: &str, op: &'static str, after: Duration, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::TransportTimeout {
            backend: backend.to_string(),
            op,
            after,
        }),
    }
}

/// Wraps any transport so every call is bounded by the same timeout
#[derive(Debug)]
pub struct Timed<T> {
    inner: T,
    timeout: Duration,
}

impl<T: Transport> Timed<T> {
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for Timed<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn is_healthy(&self) -> bool {
        tokio::time::timeout(self.timeout, self.inner.is_healthy())
            .await
            .unwrap_or(false)
    }

    async fn put_outbox(&self, name: &str, bytes: &[u8]) -> Result<(), SyncError> {
        bounded(self.name(), "put_outbox", self.timeout, self.inner.put_outbox(name, bytes)).await
    }

    async fn list_inbox(&self) -> Result<Vec<String>, SyncError> {
        bounded(self.name(), "list_inbox", self.timeout, self.inner.list_inbox()).await
    }

    async fn get_inbox(&self, name: &str) -> Result<Vec<u8>, SyncError> {
        bounded(self.name(), "get_inbox", self.timeout, self.inner.get_inbox(name)).await
    }

    async fn archive(&self, name: &str) -> Result<(), SyncError> {
        bounded(self.name(), "archive", self.timeout, self.inner.archive(name)).await
    }

    async fn reject(&self, name: &str, record: &RejectionRecord) -> Result<(), SyncError> {
        bounded(self.name(), "reject", self.timeout, self.inner.reject(name, record)).await
    }

    async fn is_archived(&self, name: &str) -> Result<bool, SyncError> {
        bounded(self.name(), "is_archived", self.timeout, self.inner.is_archived(name)).await
    }

    async fn list_namespace(&self, namespace: Namespace) -> Result<Vec<String>, SyncError> {
        bounded(
            self.name(),
            "list_namespace",
            self.timeout,
            self.inner.list_namespace(namespace),
        )
        .await
    }
}

/// Blob names are single path components: no separators, no parent
/// references, not hidden.
pub fn validate_name(name: &str) -> Result<(), SyncError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.chars().any(|c| c.is_control());
    if bad {
        return Err(SyncError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let res: Result<(), _> = bounded("slow", "put_outbox", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = res.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, SyncError::TransportTimeout { op: "put_outbox", .. }));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Opus-alice-laptop-20260223T023552Z.seed.json.enc").is_ok());
        for bad in ["", ".hidden", "../x", "a/b", "a\\b", "a..b"] {
            assert!(validate_name(bad).is_err(), "{bad} should be rejected");
        }
    }
}
