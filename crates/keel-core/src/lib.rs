//! # Keel Core
//!
//! Core types for the Keel trust substrate:
//! - [`KeyStore`]: the agent's Ed25519/X25519 keypair plus imported peer keys
//! - [`DetachedSignature`]: detached signatures over canonical payloads
//! - [`Envelope`]: hybrid multi-recipient encryption
//! - [`SignedToken`] / [`TokenAuthority`]: capability tokens with revocation and expiry
//! - [`TrustLifecycle`]: coarse lifecycle label derived from on-disk artifacts

pub mod authority;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod identity;
pub mod keystore;
pub mod lifecycle;
pub mod signature;
pub mod store;
pub mod summary;
pub mod token;

pub use authority::{IssueOptions, TokenAuthority, TokenVerdict};
pub use envelope::{Envelope, RecipientStanza};
pub use error::{AuthError, CryptoError, ErrorKind, StorageError};
pub use hash::{canonical_bytes, Hash};
pub use identity::{fingerprint_of, AgentKeys, KeyMaterial, PublicIdentity, RotationRecord};
pub use keystore::KeyStore;
pub use lifecycle::{ArtifactHealth, ArtifactReport, EntanglementRecord, TrustLifecycle};
pub use signature::DetachedSignature;
pub use store::{
    MemoryRevocationSet, MemoryTokenStore, RevocationRecord, RevocationStore, TokenStore,
};
pub use summary::{MemorySummary, MergeDecision, PillarStatus, TrustSummary, Versioned};
pub use token::{Capability, SignedToken, TokenPayload, TokenType};
