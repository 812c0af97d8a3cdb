//! # Keel Sync
//!
//! Encrypted multi-device replication of agent state.
//!
//! - **Seeds**: small signed snapshots (memory, trust, manifest) merged
//!   last-writer-wins on every device
//! - **Vaults**: full signed backups restored all-or-nothing
//! - **Transports**: local folder and git backends behind one trait, each
//!   call bounded by a timeout
//!
//! Everything that leaves the device is signed by the agent key and sealed
//! for the recipient set before a transport sees it.

pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod local;
pub mod naming;
pub mod seed;
pub mod transport;
pub mod vault;

pub use config::{BackendConfig, BackendKind, SyncConfig};
pub use engine::{BackendRun, BackendStatus, EngineStatus, SyncEngine, SyncState};
pub use error::SyncError;
pub use git::GitTransport;
pub use local::LocalTransport;
pub use naming::AgentInfo;
pub use seed::{MergeOutcome, PullReport, Rejected, Seed, SeedService, SeedStatus, SignedSeed};
pub use transport::{Namespace, RejectionRecord, Timed, Transport};
pub use vault::{
    ArchiveEntry, RestoreReport, VaultArchive, VaultManifest, VaultPullReport, VaultService,
    VaultStatus,
};
