pub mod identity;
pub mod seed;
pub mod status;
pub mod token;
pub mod vault;

use anyhow::{bail, Context, Result};
use keel_core::KeyStore;
use keel_persist::{AgentHome, FileKeyStore};
use keel_sync::{BackendRun, SyncEngine};

use crate::print_error;

/// Load the agent's keys, with a hint when there are none yet
pub async fn load_keys(home: &AgentHome) -> Result<KeyStore> {
    if !home.has_identity() {
        bail!(
            "No agent identity under {}. Run `keel identity init <name>` first.",
            home.root().display()
        );
    }
    FileKeyStore::new(home.clone())
        .load()
        .await
        .with_context(|| format!("Failed to load identity from {}", home.root().display()))
}

pub async fn open_engine(home: &AgentHome) -> Result<SyncEngine> {
    load_keys(home).await?;
    SyncEngine::open(home.clone())
        .await
        .context("Failed to open sync engine")
}

/// Report per-backend failures; error out only when every backend failed
pub fn check_runs<T>(runs: &[BackendRun<T>]) -> Result<()> {
    for run in runs {
        if let Err(e) = &run.result {
            let hint = if e.is_retryable() { " (retryable)" } else { "" };
            print_error(&format!("{}: {}{}", run.backend, e, hint));
        }
    }
    if !runs.is_empty() && runs.iter().all(|r| !r.is_ok()) {
        bail!("All sync backends failed");
    }
    Ok(())
}

pub fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
