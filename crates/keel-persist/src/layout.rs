//! Agent home directory layout

use std::path::{Path, PathBuf};

use keel_core::StorageError;
use tokio::fs;

/// Top-level components of the agent home that are replicated by vaults
pub const PILLARS: [&str; 4] = ["identity", "memory", "trust", "security"];

/// Paths of every artifact under an agent home.
///
/// ```text
/// <home>/
///   manifest.json
///   identity/{identity.json, agent.key, peers/, rotations.jsonl}
///   memory/summary.json
///   trust/{trust.json, entanglements/}
///   security/{tokens.jsonl, revoked.jsonl}
///   sync/{config.json, state.json, devices.json, <backend>/}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentHome {
    root: PathBuf,
}

impl AgentHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.root.join("identity")
    }

    pub fn identity(&self) -> PathBuf {
        self.identity_dir().join("identity.json")
    }

    pub fn private_key(&self) -> PathBuf {
        self.identity_dir().join("agent.key")
    }

    pub fn peers_dir(&self) -> PathBuf {
        self.identity_dir().join("peers")
    }

    pub fn peer(&self, fingerprint: &str) -> PathBuf {
        self.peers_dir()
            .join(format!("{}.json", fingerprint.to_uppercase()))
    }

    pub fn rotations(&self) -> PathBuf {
        self.identity_dir().join("rotations.jsonl")
    }

    pub fn memory_summary(&self) -> PathBuf {
        self.root.join("memory").join("summary.json")
    }

    pub fn trust_record(&self) -> PathBuf {
        self.root.join("trust").join("trust.json")
    }

    pub fn entanglements_dir(&self) -> PathBuf {
        self.root.join("trust").join("entanglements")
    }

    pub fn tokens(&self) -> PathBuf {
        self.root.join("security").join("tokens.jsonl")
    }

    pub fn revocations(&self) -> PathBuf {
        self.root.join("security").join("revoked.jsonl")
    }

    pub fn sync_dir(&self) -> PathBuf {
        self.root.join("sync")
    }

    pub fn sync_config(&self) -> PathBuf {
        self.sync_dir().join("config.json")
    }

    pub fn sync_state(&self) -> PathBuf {
        self.sync_dir().join("state.json")
    }

    pub fn devices(&self) -> PathBuf {
        self.sync_dir().join("devices.json")
    }

    /// Staging root for a named transport backend
    pub fn backend_dir(&self, backend: &str) -> PathBuf {
        self.sync_dir().join(backend)
    }

    pub fn has_identity(&self) -> bool {
        self.identity().exists() && self.private_key().exists()
    }

    /// Create every directory of the layout
    pub async fn ensure(&self) -> Result<(), StorageError> {
        for dir in [
            self.identity_dir(),
            self.peers_dir(),
            self.root.join("memory"),
            self.root.join("trust"),
            self.entanglements_dir(),
            self.root.join("security"),
            self.sync_dir(),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}
