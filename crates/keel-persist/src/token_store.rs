//! Append-only token log at `security/tokens.jsonl`

use std::path::PathBuf;

use async_trait::async_trait;
use keel_core::{SignedToken, StorageError, TokenStore};
use tokio::sync::RwLock;

use crate::atomic::{append_line, read_lines};

/// JSON Lines token store with an in-memory cache.
///
/// Lines are only ever appended; the cache is loaded once on open.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    cache: RwLock<Vec<SignedToken>>,
}

impl FileTokenStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let tokens = read_lines(&path).await?;
        Ok(Self {
            path,
            cache: RwLock::new(tokens),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn append(&self, token: &SignedToken) -> Result<bool, StorageError> {
        let mut cache = self.cache.write().await;
        if cache.iter().any(|t| t.token_id() == token.token_id()) {
            return Ok(false);
        }
        append_line(&self.path, token).await?;
        cache.push(token.clone());
        Ok(true)
    }

    async fn get(&self, token_id: &str) -> Result<Option<SignedToken>, StorageError> {
        let cache = self.cache.read().await;
        Ok(cache.iter().find(|t| t.token_id() == token_id).cloned())
    }

    async fn list(&self) -> Result<Vec<SignedToken>, StorageError> {
        Ok(self.cache.read().await.clone())
    }
}
