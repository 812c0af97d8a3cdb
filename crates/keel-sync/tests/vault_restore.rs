//! Vault backup and all-or-nothing restore between two paired devices

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use keel_core::{ErrorKind, KeyStore, MemorySummary, Versioned};
use keel_persist::{AgentHome, FileKeyStore, LocalState};
use keel_sync::{
    AgentInfo, ArchiveEntry, LocalTransport, Namespace, SyncError, Transport, VaultArchive,
    VaultService,
};
use tempfile::tempdir;

struct Device {
    home: AgentHome,
    vaults: VaultService,
    transport: LocalTransport,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 23, 2, 35, 52).unwrap()
}

fn memory(total: u64) -> Versioned<MemorySummary> {
    Versioned::new(
        MemorySummary {
            total,
            short_term: total,
            mid_term: 0,
            long_term: 0,
        },
        t0() - Duration::hours(1),
    )
}

fn device(home: AgentHome, keys: KeyStore, host: &str) -> Device {
    Device {
        vaults: VaultService::new(
            Arc::new(keys),
            home.clone(),
            AgentInfo::new("Opus", "alice", host),
            Vec::new(),
        ),
        transport: LocalTransport::new(home.backend_dir("local")),
        home,
    }
}

async fn paired(root: &Path) -> (Device, Device) {
    let home_a = AgentHome::new(root.join("a"));
    let home_b = AgentHome::new(root.join("b"));
    let files_a = FileKeyStore::new(home_a.clone());
    let files_b = FileKeyStore::new(home_b.clone());
    let mut keys_a = files_a.create("Opus", t0()).await.unwrap();
    let mut keys_b = files_b.create("Opus", t0()).await.unwrap();
    files_a
        .add_peer(&mut keys_a, keys_b.identity().clone())
        .await
        .unwrap();
    files_b
        .add_peer(&mut keys_b, keys_a.identity().clone())
        .await
        .unwrap();
    (device(home_a, keys_a, "laptop"), device(home_b, keys_b, "desktop"))
}

fn restore_leftovers(home: &AgentHome) -> usize {
    std::fs::read_dir(home.root())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(".restore-"))
        .count()
}

#[tokio::test]
async fn test_vault_roundtrip_restores_peer_state() {
    let dir = tempdir().unwrap();
    let (a, b) = paired(dir.path()).await;
    let state_a = LocalState::new(a.home.clone());
    let state_b = LocalState::new(b.home.clone());
    state_a.write_memory(&memory(500)).await.unwrap();
    state_b.write_memory(&memory(1)).await.unwrap();
    let b_identity = std::fs::read(b.home.identity()).unwrap();
    let b_key = std::fs::read(b.home.private_key()).unwrap();

    let name = a.vaults.push_at(&a.transport, t0()).await.unwrap();
    assert_eq!(name, "vault-Opus-alice-laptop-20260223T023552Z.vault.json");
    a.transport.deliver_outbox_to(&b.transport).await.unwrap();

    let report = b.vaults.pull(&b.transport).await.unwrap();
    let (restored, detail) = report.restored.expect("vault restored");
    assert_eq!(restored, name);
    assert!(detail.components.contains(&"memory".to_string()));
    assert!(report.rejected.is_empty());

    assert_eq!(state_b.memory().await.unwrap(), Some(memory(500)));
    // own identity and key survive, and b still knows a
    assert_eq!(std::fs::read(b.home.identity()).unwrap(), b_identity);
    assert_eq!(std::fs::read(b.home.private_key()).unwrap(), b_key);
    let reloaded = FileKeyStore::new(b.home.clone()).load().await.unwrap();
    assert_eq!(reloaded.peers().count(), 1);
    assert_eq!(restore_leftovers(&b.home), 0);

    let listing = b.vaults.list(&b.transport).await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].namespace, Namespace::Archive);
}

#[tokio::test]
async fn test_half_failed_unpack_leaves_live_tree_intact() {
    let dir = tempdir().unwrap();
    let (a, b) = paired(dir.path()).await;
    let state_b = LocalState::new(b.home.clone());
    state_b.write_memory(&memory(7)).await.unwrap();
    let before = std::fs::read(b.home.memory_summary()).unwrap();

    // the second entry needs the first to be a directory, so staging fails
    // halfway through
    let hostile = VaultArchive {
        entries: vec![
            ArchiveEntry::new("memory/a.json", b"{}"),
            ArchiveEntry::new("memory/a.json/b.json", b"{}"),
        ],
    };

    let err = b.vaults.restore(&hostile).await.unwrap_err();
    assert!(matches!(err, SyncError::PartialRestore(_)));
    assert_eq!(err.kind(), Some(ErrorKind::PartialRestore));
    assert_eq!(std::fs::read(b.home.memory_summary()).unwrap(), before);
    assert!(!b.home.root().join("memory").join("a.json").exists());
    assert_eq!(restore_leftovers(&b.home), 0);

    // the same archive delivered as a signed vault is quarantined
    let blob = a.vaults.seal(&hostile, t0()).unwrap();
    let name = "vault-Opus-alice-laptop-20260223T023552Z.vault.json";
    b.transport
        .put_inbox(name, &serde_json::to_vec(&blob).unwrap())
        .await
        .unwrap();
    let report = b.vaults.pull(&b.transport).await.unwrap();
    assert!(report.restored.is_none());
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].kind, ErrorKind::PartialRestore);
    assert_eq!(std::fs::read(b.home.memory_summary()).unwrap(), before);
}

#[tokio::test]
async fn test_newest_vault_wins() {
    let dir = tempdir().unwrap();
    let (a, b) = paired(dir.path()).await;
    let state_a = LocalState::new(a.home.clone());

    state_a.write_memory(&memory(1)).await.unwrap();
    let older = a.vaults.push_at(&a.transport, t0()).await.unwrap();
    state_a.write_memory(&memory(2)).await.unwrap();
    let newer = a
        .vaults
        .push_at(&a.transport, t0() + Duration::minutes(5))
        .await
        .unwrap();
    a.transport.deliver_outbox_to(&b.transport).await.unwrap();

    let report = b.vaults.pull(&b.transport).await.unwrap();
    assert_eq!(report.restored.map(|(n, _)| n), Some(newer));
    assert_eq!(report.superseded, vec![older]);
    assert_eq!(
        LocalState::new(b.home.clone()).memory().await.unwrap(),
        Some(memory(2))
    );
}
