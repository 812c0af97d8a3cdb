//! Seeds: small signed, encrypted state snapshots
//!
//! Push collects the replicated state groups, signs them with the agent key,
//! seals the signed seed for the recipient set and drops it in the outbox.
//! Pull walks the inbox: duplicates are archived without merging, anything
//! that fails to decrypt, parse or verify is quarantined with a reason, and
//! the rest is merged group by group (last writer wins) and archived.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{
    canonical_bytes, DetachedSignature, Envelope, ErrorKind, KeyStore, MemorySummary,
    MergeDecision, PillarStatus, PublicIdentity, TrustSummary, Versioned,
};
use keel_persist::{AgentManifest, DeviceMap, LocalState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::naming::{is_sealed_seed, AgentInfo, StampClock, SEALED_SUFFIX};
use crate::transport::{Namespace, RejectionRecord, Transport};

pub const SEED_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedAgent {
    pub name: String,
    pub fingerprint: String,
    pub host: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    pub seed_version: String,
    pub agent: SeedAgent,
    pub timestamp_utc: DateTime<Utc>,
    /// Groups the sender has never written are left out, never zeroed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_summary: Option<MemorySummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_summary: Option<TrustSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<BTreeMap<String, PillarStatus>>,
}

impl Seed {
    pub fn device_key(&self) -> String {
        AgentInfo::new(&self.agent.name, &self.agent.user, &self.agent.host).device_key()
    }
}

/// What travels inside the envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedSeed {
    pub seed: Seed,
    pub signature: DetachedSignature,
}

/// Per-group result of merging one seed. `None` means the seed did not
/// carry the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub memory: Option<MergeDecision>,
    pub trust: Option<MergeDecision>,
    pub manifest: Option<MergeDecision>,
    pub device_advanced: bool,
}

impl MergeOutcome {
    pub fn has_conflict(&self) -> bool {
        [self.memory, self.trust, self.manifest].contains(&Some(MergeDecision::Conflict))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejected {
    pub name: String,
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReport {
    pub merged: Vec<(String, MergeOutcome)>,
    pub duplicates: Vec<String>,
    pub rejected: Vec<Rejected>,
}

impl PullReport {
    pub fn conflicts(&self) -> usize {
        self.merged.iter().filter(|(_, o)| o.has_conflict()).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedStatus {
    pub outbox: usize,
    pub inbox: usize,
    pub archived: usize,
    pub rejected: usize,
    pub devices: DeviceMap,
}

pub struct SeedService {
    keys: Arc<KeyStore>,
    state: LocalState,
    agent: AgentInfo,
    recipients: Vec<String>,
    clock: StampClock,
}

impl SeedService {
    /// `recipients` are fingerprints; empty means self plus every paired peer
    pub fn new(keys: Arc<KeyStore>, state: LocalState, agent: AgentInfo, recipients: Vec<String>) -> Self {
        Self {
            keys,
            state,
            agent,
            recipients,
            clock: StampClock::new(),
        }
    }

    /// Snapshot of the replicated groups at `at`
    pub async fn collect(&self, at: DateTime<Utc>) -> Result<Seed, SyncError> {
        let memory = self.state.memory().await?.map(|v| v.value);
        let trust = self.state.trust().await?.map(|v| v.value);
        let manifest = self.state.manifest().await?.map(|m| m.pillars);

        Ok(Seed {
            seed_version: SEED_VERSION.to_string(),
            agent: SeedAgent {
                name: self.agent.name.clone(),
                fingerprint: self.keys.fingerprint().to_string(),
                host: self.agent.host.clone(),
                user: self.agent.user.clone(),
            },
            timestamp_utc: at,
            memory_summary: memory,
            trust_summary: trust,
            manifest,
        })
    }

    /// Sign then encrypt
    pub fn seal(&self, seed: &Seed) -> Result<Vec<u8>, SyncError> {
        let message = canonical_bytes(seed).map_err(|e| SyncError::Malformed(e.to_string()))?;
        let signed = SignedSeed {
            seed: seed.clone(),
            signature: self.keys.sign(&message),
        };
        let plaintext = serde_json::to_vec(&signed).map_err(|e| SyncError::Malformed(e.to_string()))?;
        let envelope = self.keys.encrypt_for(&plaintext, &recipient_set(&self.keys, &self.recipients)?)?;
        Ok(envelope.to_bytes()?)
    }

    /// Decrypt, parse and verify a sealed seed
    pub fn open(&self, bytes: &[u8]) -> Result<Seed, SyncError> {
        let envelope = Envelope::from_bytes(bytes)?;
        let plaintext = self.keys.decrypt(&envelope)?;
        let signed: SignedSeed =
            serde_json::from_slice(&plaintext).map_err(|e| SyncError::Malformed(e.to_string()))?;

        let claimed = &signed.seed.agent.fingerprint;
        if !signed.signature.signer.eq_ignore_ascii_case(claimed) {
            return Err(SyncError::Crypto(keel_core::CryptoError::InvalidSignature(format!(
                "seed claims {} but is signed by {}",
                claimed, signed.signature.signer
            ))));
        }
        let key = self
            .keys
            .verifying_key_for(claimed)
            .ok_or_else(|| SyncError::UnknownSender(claimed.clone()))?;
        let message =
            canonical_bytes(&signed.seed).map_err(|e| SyncError::Malformed(e.to_string()))?;
        signed.signature.verify(&message, &key)?;
        Ok(signed.seed)
    }

    pub async fn push(&self, transport: &dyn Transport) -> Result<String, SyncError> {
        self.push_at(transport, Utc::now()).await
    }

    /// Push a seed stamped at `now`; returns the sealed blob name
    pub async fn push_at(&self, transport: &dyn Transport, now: DateTime<Utc>) -> Result<String, SyncError> {
        let outbox = transport.list_namespace(Namespace::Outbox).await?;
        let mut stamp = self.clock.next(now).await;
        let mut name = format!("{}{SEALED_SUFFIX}", self.agent.seed_name(stamp));
        while outbox.contains(&name) {
            stamp = self.clock.bump_past(stamp).await;
            name = format!("{}{SEALED_SUFFIX}", self.agent.seed_name(stamp));
        }

        let seed = self.collect(stamp).await?;
        let blob = self.seal(&seed)?;
        transport.put_outbox(&name, &blob).await?;
        info!(backend = transport.name(), name = %name, "Pushed seed");
        Ok(name)
    }

    /// Merge a verified seed into local state. Groups the seed does not
    /// carry are left alone. Merging the same seed again changes nothing.
    pub async fn merge(&self, seed: &Seed) -> Result<MergeOutcome, SyncError> {
        let at = seed.timestamp_utc;

        let memory = match &seed.memory_summary {
            Some(value) => Some(self.merge_memory(Versioned::new(value.clone(), at)).await?),
            None => None,
        };
        let trust = match &seed.trust_summary {
            Some(value) => Some(self.merge_trust(Versioned::new(value.clone(), at)).await?),
            None => None,
        };
        let manifest = match &seed.manifest {
            Some(value) => Some(self.merge_manifest(Versioned::new(value.clone(), at)).await?),
            None => None,
        };

        let device_advanced = self.state.record_device(&seed.device_key(), at).await?;

        let outcome = MergeOutcome {
            memory,
            trust,
            manifest,
            device_advanced,
        };
        if outcome.has_conflict() {
            warn!(
                from = %seed.device_key(),
                at = %at,
                ?outcome,
                "Equal-timestamp seed disagrees with local state"
            );
        }
        Ok(outcome)
    }

    async fn merge_memory(&self, incoming: Versioned<MemorySummary>) -> Result<MergeDecision, SyncError> {
        match self.state.memory().await? {
            Some(mut local) => {
                let decision = local.merge(&incoming);
                if changed(decision) {
                    self.state.write_memory(&local).await?;
                }
                Ok(decision)
            }
            None => {
                self.state.write_memory(&incoming).await?;
                Ok(MergeDecision::Applied)
            }
        }
    }

    async fn merge_trust(&self, incoming: Versioned<TrustSummary>) -> Result<MergeDecision, SyncError> {
        match self.state.trust().await? {
            Some(mut local) => {
                let decision = local.merge(&incoming);
                if changed(decision) {
                    self.state.write_trust(&local).await?;
                }
                Ok(decision)
            }
            None => {
                self.state.write_trust(&incoming).await?;
                Ok(MergeDecision::Applied)
            }
        }
    }

    async fn merge_manifest(
        &self,
        incoming: Versioned<BTreeMap<String, PillarStatus>>,
    ) -> Result<MergeDecision, SyncError> {
        match self.state.manifest().await? {
            Some(mut local) => {
                let mut pillars = local.pillars_versioned();
                let decision = pillars.merge(&incoming);
                if changed(decision) {
                    local.set_pillars(pillars);
                    self.state.write_manifest(&local).await?;
                }
                Ok(decision)
            }
            None => {
                let mut local = AgentManifest::new(&self.agent.name, incoming.updated_at);
                local.set_pillars(incoming);
                self.state.write_manifest(&local).await?;
                Ok(MergeDecision::Applied)
            }
        }
    }

    pub async fn pull(&self, transport: &dyn Transport) -> Result<PullReport, SyncError> {
        let mut report = PullReport::default();

        for name in transport.list_inbox().await? {
            if !is_sealed_seed(&name) {
                continue;
            }

            if transport.is_archived(&name).await? {
                transport.archive(&name).await?;
                debug!(name = %name, "Skipping replayed seed");
                report.duplicates.push(name);
                continue;
            }

            let bytes = transport.get_inbox(&name).await?;
            let seed = match self.open(&bytes) {
                Ok(seed) => seed,
                Err(e) if e.is_artifact_fault() => {
                    let rejected = quarantine(transport, &name, &e).await?;
                    report.rejected.push(rejected);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let outcome = self.merge(&seed).await?;
            transport.archive(&name).await?;
            info!(backend = transport.name(), name = %name, "Merged seed");
            report.merged.push((name, outcome));
        }
        Ok(report)
    }

    pub async fn status(&self, transport: &dyn Transport) -> Result<SeedStatus, SyncError> {
        let count = |names: Vec<String>| names.iter().filter(|n| is_sealed_seed(n)).count();
        Ok(SeedStatus {
            outbox: count(transport.list_namespace(Namespace::Outbox).await?),
            inbox: count(transport.list_namespace(Namespace::Inbox).await?),
            archived: count(transport.list_namespace(Namespace::Archive).await?),
            rejected: count(transport.list_namespace(Namespace::Rejected).await?),
            devices: self.state.devices().await?,
        })
    }
}

/// Configured recipients, or self plus every paired peer when none are set
pub(crate) fn recipient_set(keys: &KeyStore, configured: &[String]) -> Result<Vec<PublicIdentity>, SyncError> {
    if configured.is_empty() {
        Ok(keys.pairing_set())
    } else {
        Ok(keys.resolve_recipients(configured)?)
    }
}

fn changed(decision: MergeDecision) -> bool {
    matches!(decision, MergeDecision::Applied | MergeDecision::Conflict)
}

/// Move a blob to the rejected namespace with a reason record
pub(crate) async fn quarantine(
    transport: &dyn Transport,
    name: &str,
    error: &SyncError,
) -> Result<Rejected, SyncError> {
    let kind = error.kind().unwrap_or(ErrorKind::MalformedPayload);
    let record = RejectionRecord {
        name: name.to_string(),
        kind,
        detail: error.to_string(),
        rejected_at: Utc::now(),
    };
    transport.reject(name, &record).await?;
    warn!(backend = transport.name(), name, %kind, error = %error, "Quarantined blob");
    Ok(Rejected {
        name: name.to_string(),
        kind,
        detail: record.detail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;
    use chrono::TimeZone;
    use keel_persist::AgentHome;
    use tempfile::tempdir;

    fn service(dir: &std::path::Path, keys: Arc<KeyStore>, host: &str) -> SeedService {
        SeedService::new(
            keys,
            LocalState::new(AgentHome::new(dir)),
            AgentInfo::new("Opus", "alice", host),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_seal_open_roundtrip() {
        let dir = tempdir().unwrap();
        let keys = Arc::new(KeyStore::generate("Opus", Utc::now()));
        let svc = service(dir.path(), keys, "laptop");

        let seed = svc.collect(Utc::now()).await.unwrap();
        let blob = svc.seal(&seed).unwrap();
        assert_eq!(svc.open(&blob).unwrap(), seed);
    }

    #[tokio::test]
    async fn test_fresh_home_collects_no_groups() {
        let dir = tempdir().unwrap();
        let keys = Arc::new(KeyStore::generate("Opus", Utc::now()));
        let svc = service(dir.path(), keys, "laptop");

        let seed = svc.collect(Utc::now()).await.unwrap();
        assert!(seed.memory_summary.is_none());
        assert!(seed.trust_summary.is_none());
        assert!(seed.manifest.is_none());
        let json = serde_json::to_value(&seed).unwrap();
        assert!(json.get("memory_summary").is_none());

        let outcome = svc.merge(&seed).await.unwrap();
        assert_eq!((outcome.memory, outcome.trust, outcome.manifest), (None, None, None));
        assert!(svc.state.memory().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpaired_sender_is_unknown() {
        let dir = tempdir().unwrap();
        let a_keys = Arc::new(KeyStore::generate("Opus", Utc::now()));
        let b_keys = KeyStore::generate("Opus", Utc::now());
        // b can decrypt (a encrypts to b) but b never learned a's signing key
        let mut a_with_b = KeyStore::new(
            keel_core::AgentKeys::from_material(&a_keys.keys().to_material()).unwrap(),
            a_keys.identity().clone(),
        )
        .unwrap();
        a_with_b.add_peer(b_keys.identity().clone()).unwrap();
        let a = service(dir.path(), Arc::new(a_with_b), "laptop");
        let blob = a.seal(&a.collect(Utc::now()).await.unwrap()).unwrap();

        let b = service(dir.path(), Arc::new(b_keys), "desktop");
        assert!(matches!(b.open(&blob), Err(SyncError::UnknownSender(_))));
    }

    #[tokio::test]
    async fn test_clock_avoids_outbox_collision() {
        let dir = tempdir().unwrap();
        let keys = Arc::new(KeyStore::generate("Opus", Utc::now()));
        let svc = service(dir.path(), keys, "laptop");
        let transport = LocalTransport::new(dir.path().join("sync").join("local"));
        let at = Utc.with_ymd_and_hms(2026, 2, 23, 2, 35, 52).unwrap();

        let first = svc.push_at(&transport, at).await.unwrap();
        let second = svc.push_at(&transport, at).await.unwrap();
        assert_eq!(first, "Opus-alice-laptop-20260223T023552Z.seed.json.enc");
        assert_eq!(second, "Opus-alice-laptop-20260223T023553Z.seed.json.enc");
    }

    #[tokio::test]
    async fn test_merge_twice_equals_once() {
        let dir = tempdir().unwrap();
        let keys = Arc::new(KeyStore::generate("Opus", Utc::now()));
        let svc = service(dir.path(), keys, "laptop");
        let mut seed = svc.collect(Utc::now()).await.unwrap();
        seed.memory_summary = Some(MemorySummary {
            total: 40,
            long_term: 40,
            ..Default::default()
        });
        seed.manifest = Some(BTreeMap::from([("memory".to_string(), PillarStatus::Active)]));

        let first = svc.merge(&seed).await.unwrap();
        assert_eq!(first.memory, Some(MergeDecision::Applied));
        assert_eq!(first.trust, None);
        let snapshot = (
            svc.state.memory().await.unwrap(),
            svc.state.trust().await.unwrap(),
            svc.state.manifest().await.unwrap(),
            svc.state.devices().await.unwrap(),
        );

        let second = svc.merge(&seed).await.unwrap();
        assert_eq!(second.memory, Some(MergeDecision::Unchanged));
        assert!(!second.device_advanced);
        assert_eq!(
            snapshot,
            (
                svc.state.memory().await.unwrap(),
                svc.state.trust().await.unwrap(),
                svc.state.manifest().await.unwrap(),
                svc.state.devices().await.unwrap(),
            )
        );
    }
}
