//! # Keel Persistence
//!
//! File-backed storage for a single agent home:
//! - [`AgentHome`]: directory layout
//! - [`FileKeyStore`]: identity, private key, peers, rotation log
//! - [`FileTokenStore`] and [`FileRevocationSet`]: append-only security logs
//! - [`LocalState`]: state replicated by seeds
//! - [`probe`]: artifact health for the trust lifecycle
//!
//! Every write goes through [`atomic`], so no reader ever sees a partially
//! written artifact under its final name.

pub mod atomic;
pub mod keystore;
pub mod layout;
pub mod probe;
pub mod revocation;
pub mod state;
pub mod token_store;

use std::sync::Arc;

use keel_core::{KeyStore, StorageError, TokenAuthority};

pub use keystore::FileKeyStore;
pub use layout::{AgentHome, PILLARS};
pub use probe::{lifecycle, probe};
pub use revocation::FileRevocationSet;
pub use state::{AgentManifest, DeviceMap, LocalState};
pub use token_store::FileTokenStore;

/// Token authority over the home's token log and revocation set
pub async fn open_authority(home: &AgentHome, keys: Arc<KeyStore>) -> Result<TokenAuthority, StorageError> {
    let tokens = FileTokenStore::open(home.tokens()).await?;
    let revocations = FileRevocationSet::open(home.revocations()).await?;
    Ok(TokenAuthority::new(keys, Arc::new(tokens), Arc::new(revocations)))
}
