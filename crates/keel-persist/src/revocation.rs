//! Durable revocation set at `security/revoked.jsonl`

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use keel_core::{RevocationRecord, RevocationStore, StorageError};
use tokio::sync::RwLock;

use crate::atomic::{append_line, read_lines};

/// Monotonic revocation set backed by an append-only log.
///
/// A revocation is fsynced before `revoke` returns. Duplicate lines (for
/// example from two processes racing) collapse to the earliest record on load.
#[derive(Debug)]
pub struct FileRevocationSet {
    path: PathBuf,
    cache: RwLock<BTreeMap<String, RevocationRecord>>,
}

impl FileRevocationSet {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut cache = BTreeMap::new();
        for record in read_lines::<RevocationRecord>(&path).await? {
            cache.entry(record.token_id.clone()).or_insert(record);
        }
        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }
}

#[async_trait]
impl RevocationStore for FileRevocationSet {
    async fn revoke(&self, record: RevocationRecord) -> Result<bool, StorageError> {
        let mut cache = self.cache.write().await;
        if cache.contains_key(&record.token_id) {
            return Ok(false);
        }
        append_line(&self.path, &record).await?;
        cache.insert(record.token_id.clone(), record);
        Ok(true)
    }

    async fn is_revoked(&self, token_id: &str) -> Result<bool, StorageError> {
        Ok(self.cache.read().await.contains_key(token_id))
    }

    async fn list(&self) -> Result<Vec<RevocationRecord>, StorageError> {
        let mut out: Vec<_> = self.cache.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.revoked_at.cmp(&b.revoked_at));
        Ok(out)
    }
}
