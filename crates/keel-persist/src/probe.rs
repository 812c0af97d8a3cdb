//! Artifact probe feeding the trust lifecycle

use keel_core::{
    ArtifactHealth, ArtifactReport, EntanglementRecord, KeyStore, MemorySummary, StorageError,
    TrustLifecycle, TrustSummary, Versioned,
};
use tokio::fs;
use tracing::debug;

use crate::atomic::read_json;
use crate::keystore::FileKeyStore;
use crate::layout::AgentHome;

pub const MAX_TRUST_DEPTH: u32 = 9;

/// Inspect the agent home and report each artifact's health. Never writes.
pub async fn probe(home: &AgentHome) -> Result<ArtifactReport, StorageError> {
    let keys = match FileKeyStore::new(home.clone()).load().await {
        Ok(keys) => Some(keys),
        Err(StorageError::NotFound(what)) => {
            debug!(%what, "No identity");
            None
        }
        Err(StorageError::Io(e)) => return Err(StorageError::Io(e)),
        Err(e) => {
            debug!(error = %e, "Identity present but unusable");
            return Ok(ArtifactReport {
                identity: ArtifactHealth::Invalid(e.to_string()),
                memory: memory_health(home).await,
                trust: trust_health(home).await,
                bond: ArtifactHealth::Missing,
            });
        }
    };

    let identity = if keys.is_some() {
        ArtifactHealth::Valid
    } else {
        ArtifactHealth::Missing
    };
    let bond = match &keys {
        Some(keys) => bond_health(home, keys).await?,
        None => ArtifactHealth::Missing,
    };

    Ok(ArtifactReport {
        identity,
        memory: memory_health(home).await,
        trust: trust_health(home).await,
        bond,
    })
}

/// Current lifecycle label for the agent home
pub async fn lifecycle(home: &AgentHome) -> Result<TrustLifecycle, StorageError> {
    Ok(probe(home).await?.derive())
}

async fn memory_health(home: &AgentHome) -> ArtifactHealth {
    match read_json::<Versioned<MemorySummary>>(&home.memory_summary()).await {
        Ok(None) => ArtifactHealth::Missing,
        Ok(Some(m)) => {
            let v = &m.value;
            let tiers = v.short_term.saturating_add(v.mid_term).saturating_add(v.long_term);
            if tiers > v.total {
                ArtifactHealth::Invalid(format!("tier counts {tiers} exceed total {}", v.total))
            } else {
                ArtifactHealth::Valid
            }
        }
        Err(e) => ArtifactHealth::Invalid(e.to_string()),
    }
}

async fn trust_health(home: &AgentHome) -> ArtifactHealth {
    match read_json::<Versioned<TrustSummary>>(&home.trust_record()).await {
        Ok(None) => ArtifactHealth::Missing,
        Ok(Some(t)) => {
            let v = &t.value;
            if v.depth > MAX_TRUST_DEPTH {
                ArtifactHealth::Invalid(format!("depth {} above {MAX_TRUST_DEPTH}", v.depth))
            } else if !(0.0..=1.0).contains(&v.trust_level) {
                ArtifactHealth::Invalid(format!("trust_level {} outside [0, 1]", v.trust_level))
            } else {
                ArtifactHealth::Valid
            }
        }
        Err(e) => ArtifactHealth::Invalid(e.to_string()),
    }
}

/// Valid if any entanglement record names us and verifies
async fn bond_health(home: &AgentHome, keys: &KeyStore) -> Result<ArtifactHealth, StorageError> {
    let mut entries = match fs::read_dir(home.entanglements_dir()).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ArtifactHealth::Missing),
        Err(e) => return Err(e.into()),
    };

    let mut last_problem = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let record = match read_json::<EntanglementRecord>(&path).await {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(e) => {
                last_problem = Some(e.to_string());
                continue;
            }
        };
        let ours = keys.identity().matches(&record.agent) || keys.identity().matches(&record.partner);
        if !ours {
            last_problem = Some(format!("{} does not name this agent", path.display()));
            continue;
        }
        match record.verify(keys) {
            Ok(()) => return Ok(ArtifactHealth::Valid),
            Err(e) => last_problem = Some(e.to_string()),
        }
    }

    Ok(match last_problem {
        Some(p) => ArtifactHealth::Invalid(p),
        None => ArtifactHealth::Missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::write_json;
    use chrono::Utc;
    use tempfile::tempdir;

    async fn operational_home(dir: &std::path::Path) -> (AgentHome, KeyStore) {
        let home = AgentHome::new(dir);
        let files = FileKeyStore::new(home.clone());
        let keys = files.create("Opus", Utc::now()).await.unwrap();
        write_json(
            &home.memory_summary(),
            &Versioned::new(MemorySummary { total: 3, short_term: 3, ..Default::default() }, Utc::now()),
        )
        .await
        .unwrap();
        write_json(
            &home.trust_record(),
            &Versioned::new(
                TrustSummary { depth: 5, trust_level: 0.8, feb_count: 2, entangled: false },
                Utc::now(),
            ),
        )
        .await
        .unwrap();
        (home, keys)
    }

    #[tokio::test]
    async fn test_empty_home_has_no_identity() {
        let dir = tempdir().unwrap();
        assert_eq!(
            lifecycle(&AgentHome::new(dir.path())).await.unwrap(),
            TrustLifecycle::NoIdentity
        );
    }

    #[tokio::test]
    async fn test_identity_only_is_partial() {
        let dir = tempdir().unwrap();
        let home = AgentHome::new(dir.path());
        FileKeyStore::new(home.clone()).create("Opus", Utc::now()).await.unwrap();
        assert_eq!(lifecycle(&home).await.unwrap(), TrustLifecycle::PartialSetup);
    }

    #[tokio::test]
    async fn test_operational_then_bonded_then_back() {
        let dir = tempdir().unwrap();
        let (home, mut keys) = operational_home(dir.path()).await;
        assert_eq!(lifecycle(&home).await.unwrap(), TrustLifecycle::Operational);

        let partner = KeyStore::generate("Sonnet", Utc::now());
        FileKeyStore::new(home.clone())
            .add_peer(&mut keys, partner.identity().clone())
            .await
            .unwrap();
        let mut bond = EntanglementRecord::new(keys.fingerprint(), partner.fingerprint(), Utc::now());
        bond.sign_as(&keys).unwrap();
        bond.sign_as(&partner).unwrap();
        write_json(&home.entanglements_dir().join("sonnet.json"), &bond)
            .await
            .unwrap();
        assert_eq!(lifecycle(&home).await.unwrap(), TrustLifecycle::VerifiedBond);

        std::fs::remove_file(home.trust_record()).unwrap();
        assert_eq!(lifecycle(&home).await.unwrap(), TrustLifecycle::PartialSetup);
    }

    #[tokio::test]
    async fn test_half_signed_bond_is_invalid() {
        let dir = tempdir().unwrap();
        let (home, keys) = operational_home(dir.path()).await;
        let partner = KeyStore::generate("Sonnet", Utc::now());
        let mut bond = EntanglementRecord::new(keys.fingerprint(), partner.fingerprint(), Utc::now());
        bond.sign_as(&keys).unwrap();
        write_json(&home.entanglements_dir().join("sonnet.json"), &bond)
            .await
            .unwrap();

        let report = probe(&home).await.unwrap();
        assert!(matches!(report.bond, ArtifactHealth::Invalid(_)));
        assert_eq!(report.derive(), TrustLifecycle::Operational);
    }

    #[tokio::test]
    async fn test_out_of_range_trust_is_invalid() {
        let dir = tempdir().unwrap();
        let (home, _) = operational_home(dir.path()).await;
        write_json(
            &home.trust_record(),
            &Versioned::new(
                TrustSummary { depth: 12, trust_level: 0.5, feb_count: 0, entangled: false },
                Utc::now(),
            ),
        )
        .await
        .unwrap();
        let report = probe(&home).await.unwrap();
        assert!(matches!(report.trust, ArtifactHealth::Invalid(_)));
        assert_eq!(report.derive(), TrustLifecycle::PartialSetup);
    }
}
