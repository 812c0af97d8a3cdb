//! Sync configuration
//!
//! Stored as `sync/config.json` under the agent home. Any field can be
//! overridden from the environment with a `KEEL__` prefix, for example
//! `KEEL__TIMEOUT_SECS=5` or `KEEL__AGENT_NAME=Opus`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use keel_persist::atomic::write_json;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Git,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Git => "git",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "git" => Ok(Self::Git),
            other => Err(SyncError::Config(format!("unknown backend '{other}'"))),
        }
    }
}

/// One configured transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Staging root, defaults to `sync/<kind>` under the agent home
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Shared folder exchanged with other devices (local only)
    #[serde(default)]
    pub shared: Option<PathBuf>,
    /// Working copy (git only)
    #[serde(default)]
    pub repo: Option<PathBuf>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub remote: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl BackendConfig {
    pub fn local() -> Self {
        Self {
            kind: BackendKind::Local,
            enabled: true,
            path: None,
            shared: None,
            repo: None,
            branch: None,
            remote: None,
        }
    }

    pub fn git(repo: impl Into<PathBuf>) -> Self {
        Self {
            kind: BackendKind::Git,
            repo: Some(repo.into()),
            ..Self::local()
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        match self.kind {
            BackendKind::Git if self.repo.is_none() => {
                Err(SyncError::Config("git backend needs a repo path".into()))
            }
            BackendKind::Local if self.repo.is_some() || self.remote.is_some() => Err(
                SyncError::Config("repo and remote only apply to the git backend".into()),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Defaults to the manifest or identity name
    pub agent_name: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    /// Recipient fingerprints; empty means self plus every paired peer
    pub recipients: Vec<String>,
    pub timeout_secs: u64,
    pub backends: Vec<BackendConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            agent_name: None,
            host: None,
            user: None,
            recipients: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            backends: Vec::new(),
        }
    }
}

impl SyncConfig {
    /// Load from `path` (missing is fine) with the `KEEL__` environment overlay
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let config: SyncConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Json).required(false))
            .add_source(
                Environment::with_prefix("KEEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        for backend in &config.backends {
            backend.validate()?;
        }
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), SyncError> {
        write_json(path, self).await?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Add a backend, replacing any existing one of the same kind
    pub fn add_backend(&mut self, backend: BackendConfig) -> Result<(), SyncError> {
        backend.validate()?;
        self.backends.retain(|b| b.kind != backend.kind);
        self.backends.push(backend);
        Ok(())
    }

    /// Enabled backends, or a plain local backend when none are configured
    pub fn active_backends(&self) -> Vec<BackendConfig> {
        let active: Vec<_> = self.backends.iter().filter(|b| b.enabled).cloned().collect();
        if active.is_empty() && self.backends.is_empty() {
            vec![BackendConfig::local()]
        } else {
            active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.recipients, Vec::<String>::new());
        assert_eq!(config.active_backends(), vec![BackendConfig::local()]);
    }

    #[tokio::test]
    async fn test_save_load_and_replace_backend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = SyncConfig {
            agent_name: Some("Opus".into()),
            ..Default::default()
        };
        config.add_backend(BackendConfig::git("/srv/keel")).unwrap();
        config
            .add_backend(BackendConfig {
                branch: Some("agents".into()),
                ..BackendConfig::git("/srv/keel2")
            })
            .unwrap();
        config.save(&path).await.unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded.backends.len(), 1);
        assert_eq!(loaded.backends[0].repo, Some(PathBuf::from("/srv/keel2")));
        assert_eq!(loaded.backends[0].branch.as_deref(), Some("agents"));
        assert_eq!(loaded.agent_name.as_deref(), Some("Opus"));
    }

    #[test]
    fn test_git_requires_repo() {
        let backend = BackendConfig {
            kind: BackendKind::Git,
            ..BackendConfig::local()
        };
        assert!(matches!(backend.validate(), Err(SyncError::Config(_))));
        assert_eq!("GIT".parse::<BackendKind>().unwrap(), BackendKind::Git);
    }
}
