//! File-backed key store

use chrono::{DateTime, Utc};
use keel_core::{AgentKeys, KeyMaterial, KeyStore, PublicIdentity, RotationRecord, StorageError};
use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::atomic::{append_line, read_json, read_lines, write_atomic, write_json};
use crate::layout::AgentHome;

/// Loads and saves identity material under `<home>/identity`.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    home: AgentHome,
}

impl FileKeyStore {
    pub fn new(home: AgentHome) -> Self {
        Self { home }
    }

    pub fn home(&self) -> &AgentHome {
        &self.home
    }

    /// Generate and persist a fresh identity. Refuses to overwrite an
    /// existing one.
    pub async fn create(&self, name: &str, now: DateTime<Utc>) -> Result<KeyStore, StorageError> {
        if self.home.has_identity() {
            return Err(StorageError::AlreadyExists(
                self.home.identity().display().to_string(),
            ));
        }
        self.home.ensure().await?;

        let store = KeyStore::generate(name, now);
        self.write_private(store.keys()).await?;
        write_json(&self.home.identity(), store.identity()).await?;

        info!(name, fingerprint = %store.fingerprint(), "Created agent identity");
        Ok(store)
    }

    /// Load our keys, every peer, and the retired fingerprints from the
    /// rotation log.
    pub async fn load(&self) -> Result<KeyStore, StorageError> {
        let identity: PublicIdentity = read_json(&self.home.identity())
            .await?
            .ok_or_else(|| StorageError::NotFound(self.home.identity().display().to_string()))?;

        let raw = Zeroizing::new(fs::read(self.home.private_key()).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(self.home.private_key().display().to_string())
            } else {
                e.into()
            }
        })?);
        let material: KeyMaterial =
            serde_json::from_slice(&raw).map_err(|e| self.corrupt_key(e.to_string()))?;
        let keys = AgentKeys::from_material(&material).map_err(|e| self.corrupt_key(e.to_string()))?;

        let mut store = KeyStore::new(keys, identity).map_err(|e| StorageError::Corrupt {
            path: self.home.identity().display().to_string(),
            detail: e.to_string(),
        })?;

        for peer in self.load_peers().await? {
            if let Err(e) = store.add_peer(peer.clone()) {
                warn!(fingerprint = %peer.fingerprint, error = %e, "Ignoring invalid peer key");
            }
        }

        let rotations: Vec<RotationRecord> = read_lines(&self.home.rotations()).await?;
        for rotation in rotations {
            store.mark_retired(&rotation.old_fingerprint);
        }
        Ok(store)
    }

    pub async fn load_peers(&self) -> Result<Vec<PublicIdentity>, StorageError> {
        let dir = self.home.peers_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut peers = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(peer) = read_json::<PublicIdentity>(&path).await? {
                peers.push(peer);
            }
        }
        peers.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(peers)
    }

    /// Validate and store a peer key, in memory and on disk
    pub async fn add_peer(&self, store: &mut KeyStore, peer: PublicIdentity) -> Result<bool, StorageError> {
        let is_new = store
            .add_peer(peer.clone())
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        write_json(&self.home.peer(&peer.fingerprint), &peer).await?;
        info!(fingerprint = %peer.fingerprint, name = %peer.name, is_new, "Stored peer key");
        Ok(is_new)
    }

    /// Rotate the identity and persist the result: new key, new public
    /// identity, old identity as a peer, and the audit record.
    pub async fn rotate(&self, store: &mut KeyStore, now: DateTime<Utc>) -> Result<RotationRecord, StorageError> {
        let record = store
            .rotate(now)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        if let Some(old) = store.lookup(&record.old_fingerprint) {
            write_json(&self.home.peer(&old.fingerprint), old).await?;
        }
        append_line(&self.home.rotations(), &record).await?;
        self.write_private(store.keys()).await?;
        write_json(&self.home.identity(), store.identity()).await?;
        Ok(record)
    }

    async fn write_private(&self, keys: &AgentKeys) -> Result<(), StorageError> {
        let material = keys.to_material();
        let bytes = Zeroizing::new(serde_json::to_vec_pretty(&material)?);
        let path = self.home.private_key();
        write_atomic(&path, &bytes).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    fn corrupt_key(&self, detail: String) -> StorageError {
        StorageError::Corrupt {
            path: self.home.private_key().display().to_string(),
            detail,
        }
    }
}
