//! Sync engine: runs seed and vault cycles against every configured backend

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{KeyStore, TrustLifecycle};
use keel_persist::atomic::{read_json, write_json};
use keel_persist::{lifecycle, AgentHome, FileKeyStore, LocalState};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{BackendConfig, BackendKind, SyncConfig};
use crate::error::SyncError;
use crate::git::GitTransport;
use crate::local::LocalTransport;
use crate::naming::AgentInfo;
use crate::seed::{PullReport, SeedService, SeedStatus};
use crate::transport::{Timed, Transport};
use crate::vault::{VaultListing, VaultPullReport, VaultService, VaultStatus};

/// `sync/state.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncState {
    pub last_push: Option<DateTime<Utc>>,
    pub last_pull: Option<DateTime<Utc>>,
    /// Last successful operation per backend
    pub backends: BTreeMap<String, DateTime<Utc>>,
    pub push_count: u64,
    pub pull_count: u64,
    pub last_error: Option<String>,
}

/// Result of one operation on one backend
#[derive(Debug)]
pub struct BackendRun<T> {
    pub backend: String,
    pub result: Result<T, SyncError>,
}

impl<T> BackendRun<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub name: String,
    pub healthy: bool,
    pub seeds: Option<SeedStatus>,
    pub vaults: Option<VaultStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub agent: AgentInfo,
    pub fingerprint: String,
    pub lifecycle: TrustLifecycle,
    pub state: SyncState,
    pub backends: Vec<BackendStatus>,
}

pub struct SyncEngine {
    home: AgentHome,
    keys: Arc<KeyStore>,
    agent: AgentInfo,
    seeds: SeedService,
    vaults: VaultService,
    transports: Vec<Box<dyn Transport>>,
}

impl SyncEngine {
    /// Load keys, sync config and state from an agent home
    pub async fn open(home: AgentHome) -> Result<Self, SyncError> {
        let keys = Arc::new(FileKeyStore::new(home.clone()).load().await?);
        let config = SyncConfig::load(&home.sync_config())?;
        let state = LocalState::new(home.clone());

        let name = match &config.agent_name {
            Some(name) => name.clone(),
            None => match state.manifest().await? {
                Some(manifest) => manifest.name,
                None => keys.identity().name.clone(),
            },
        };
        let agent = AgentInfo::new(name, resolve_user(&config), resolve_host(&config));

        let mut transports = Vec::new();
        for backend in config.active_backends() {
            transports.push(build_transport(&home, &backend, &config)?);
        }

        Ok(Self {
            seeds: SeedService::new(keys.clone(), state, agent.clone(), config.recipients.clone()),
            vaults: VaultService::new(keys.clone(), home.clone(), agent.clone(), config.recipients.clone()),
            home,
            keys,
            agent,
            transports,
        })
    }

    /// Persist a backend in the sync config, replacing one of the same kind
    pub async fn add_backend(home: &AgentHome, backend: BackendConfig) -> Result<SyncConfig, SyncError> {
        let path = home.sync_config();
        let mut config = SyncConfig::load(&path)?;
        config.add_backend(backend)?;
        config.save(&path).await?;
        info!(path = %path.display(), "Updated sync backends");
        Ok(config)
    }

    pub fn agent(&self) -> &AgentInfo {
        &self.agent
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn seeds(&self) -> &SeedService {
        &self.seeds
    }

    pub fn vaults(&self) -> &VaultService {
        &self.vaults
    }

    pub fn transports(&self) -> &[Box<dyn Transport>] {
        &self.transports
    }

    pub async fn push_seed(&self) -> Result<Vec<BackendRun<String>>, SyncError> {
        let mut runs = Vec::new();
        for transport in &self.transports {
            runs.push(BackendRun {
                backend: transport.name().to_string(),
                result: self.seeds.push(transport.as_ref()).await,
            });
        }
        self.record(&runs, Direction::Push).await?;
        Ok(runs)
    }

    pub async fn pull_seeds(&self) -> Result<Vec<BackendRun<PullReport>>, SyncError> {
        let mut runs = Vec::new();
        for transport in &self.transports {
            runs.push(BackendRun {
                backend: transport.name().to_string(),
                result: self.seeds.pull(transport.as_ref()).await,
            });
        }
        self.record(&runs, Direction::Pull).await?;
        Ok(runs)
    }

    pub async fn push_vault(&self) -> Result<Vec<BackendRun<String>>, SyncError> {
        let mut runs = Vec::new();
        for transport in &self.transports {
            runs.push(BackendRun {
                backend: transport.name().to_string(),
                result: self.vaults.push(transport.as_ref()).await,
            });
        }
        self.record(&runs, Direction::Push).await?;
        Ok(runs)
    }

    /// Pull vaults, stopping at the first backend that restores one
    pub async fn pull_vault(&self) -> Result<Vec<BackendRun<VaultPullReport>>, SyncError> {
        let mut runs = Vec::new();
        for transport in &self.transports {
            let result = self.vaults.pull(transport.as_ref()).await;
            let restored = matches!(&result, Ok(report) if report.restored.is_some());
            runs.push(BackendRun {
                backend: transport.name().to_string(),
                result,
            });
            if restored {
                break;
            }
        }
        self.record(&runs, Direction::Pull).await?;
        Ok(runs)
    }

    pub async fn list_vaults(&self) -> Result<Vec<BackendRun<Vec<VaultListing>>>, SyncError> {
        let mut runs = Vec::new();
        for transport in &self.transports {
            runs.push(BackendRun {
                backend: transport.name().to_string(),
                result: self.vaults.list(transport.as_ref()).await,
            });
        }
        Ok(runs)
    }

    pub async fn status(&self) -> Result<EngineStatus, SyncError> {
        let mut backends = Vec::new();
        for transport in &self.transports {
            let healthy = transport.is_healthy().await;
            let (seeds, vaults) = if healthy {
                (
                    self.seeds.status(transport.as_ref()).await.ok(),
                    self.vaults.status(transport.as_ref()).await.ok(),
                )
            } else {
                (None, None)
            };
            backends.push(BackendStatus {
                name: transport.name().to_string(),
                healthy,
                seeds,
                vaults,
            });
        }

        Ok(EngineStatus {
            agent: self.agent.clone(),
            fingerprint: self.keys.fingerprint().to_string(),
            lifecycle: lifecycle(&self.home).await?,
            state: self.load_state().await?,
            backends,
        })
    }

    pub async fn load_state(&self) -> Result<SyncState, SyncError> {
        Ok(read_json(&self.home.sync_state()).await?.unwrap_or_default())
    }

    async fn record<T>(&self, runs: &[BackendRun<T>], direction: Direction) -> Result<(), SyncError> {
        let mut state = self.load_state().await?;
        let now = Utc::now();
        for run in runs {
            match &run.result {
                Ok(_) => {
                    state.backends.insert(run.backend.clone(), now);
                    match direction {
                        Direction::Push => {
                            state.last_push = Some(now);
                            state.push_count += 1;
                        }
                        Direction::Pull => {
                            state.last_pull = Some(now);
                            state.pull_count += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        backend = %run.backend,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Sync operation failed"
                    );
                    state.last_error = Some(format!("{}: {}", run.backend, e));
                }
            }
        }
        write_json(&self.home.sync_state(), &state).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Push,
    Pull,
}

fn build_transport(
    home: &AgentHome,
    backend: &BackendConfig,
    config: &SyncConfig,
) -> Result<Box<dyn Transport>, SyncError> {
    backend.validate()?;
    let timeout = config.timeout();
    let staging = backend
        .path
        .clone()
        .unwrap_or_else(|| home.backend_dir(backend.kind.as_str()));

    Ok(match backend.kind {
        BackendKind::Local => {
            let mut local = LocalTransport::new(staging);
            if let Some(shared) = &backend.shared {
                local = local.with_shared(shared);
            }
            Box::new(Timed::new(local, timeout))
        }
        BackendKind::Git => {
            let repo = backend
                .repo
                .clone()
                .ok_or_else(|| SyncError::Config("git backend needs a repo path".into()))?;
            let mut git = GitTransport::new(repo, staging);
            if let Some(branch) = &backend.branch {
                git = git.with_branch(branch);
            }
            if let Some(remote) = &backend.remote {
                git = git.with_remote(remote);
            }
            Box::new(Timed::new(git, timeout))
        }
    })
}

/// Configured host, else the OS hostname
fn resolve_host(config: &SyncConfig) -> String {
    config
        .host
        .clone()
        .filter(|h| !h.is_empty())
        .or_else(system_hostname)
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|h| !h.is_empty())
}

fn resolve_user(config: &SyncConfig) -> String {
    config
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .or_else(|| std::env::var("USERNAME").ok())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
