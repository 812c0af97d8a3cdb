//! Token and revocation store traits with in-memory implementations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::token::SignedToken;

/// Append-only record of issued and imported tokens
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Store a token. Appending a token whose id is already present is a
    /// no-op; returns `true` only when the token was new.
    async fn append(&self, token: &SignedToken) -> Result<bool, StorageError>;

    async fn get(&self, token_id: &str) -> Result<Option<SignedToken>, StorageError>;

    /// All tokens, in the order they were appended
    async fn list(&self) -> Result<Vec<SignedToken>, StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub token_id: String,
    pub revoked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Monotonic set of revoked token ids
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Durably record a revocation. Returns `true` if the id was not already
    /// revoked; revoking twice keeps the first record.
    async fn revoke(&self, record: RevocationRecord) -> Result<bool, StorageError>;

    async fn is_revoked(&self, token_id: &str) -> Result<bool, StorageError>;

    async fn list(&self) -> Result<Vec<RevocationRecord>, StorageError>;
}

/// In-memory token store (for testing)
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<Vec<SignedToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn append(&self, token: &SignedToken) -> Result<bool, StorageError> {
        let mut tokens = self.tokens.write().await;
        if tokens.iter().any(|t| t.token_id() == token.token_id()) {
            return Ok(false);
        }
        tokens.push(token.clone());
        Ok(true)
    }

    async fn get(&self, token_id: &str) -> Result<Option<SignedToken>, StorageError> {
        let tokens = self.tokens.read().await;
        Ok(tokens.iter().find(|t| t.token_id() == token_id).cloned())
    }

    async fn list(&self) -> Result<Vec<SignedToken>, StorageError> {
        Ok(self.tokens.read().await.clone())
    }
}

/// In-memory revocation set (for testing)
#[derive(Debug, Default)]
pub struct MemoryRevocationSet {
    records: RwLock<HashMap<String, RevocationRecord>>,
}

impl MemoryRevocationSet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationSet {
    async fn revoke(&self, record: RevocationRecord) -> Result<bool, StorageError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.token_id) {
            return Ok(false);
        }
        records.insert(record.token_id.clone(), record);
        Ok(true)
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, StorageError> {
        Ok(self.records.read().await.contains_key(token_id))
    }

    async fn list(&self) -> Result<Vec<RevocationRecord>, StorageError> {
        let mut out: Vec<_> = self.records.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.revoked_at.cmp(&b.revoked_at));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revocation_is_monotonic() {
        let set = MemoryRevocationSet::new();
        let first = RevocationRecord {
            token_id: "abc".into(),
            revoked_at: Utc::now(),
            reason: Some("lost device".into()),
        };
        assert!(set.revoke(first.clone()).await.unwrap());

        let again = RevocationRecord {
            reason: None,
            ..first.clone()
        };
        assert!(!set.revoke(again).await.unwrap());
        assert!(set.is_revoked("abc").await.unwrap());
        assert_eq!(set.list().await.unwrap(), vec![first]);
    }
}
