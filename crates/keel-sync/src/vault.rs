//! Vaults: full signed, encrypted backups of the agent home
//!
//! A vault carries every replicated file under the home (never the private
//! key, never transport staging) with per-file hashes. Restores are all or
//! nothing: entries are staged inside the home, then each top-level
//! component is swapped into place with a backup, and any failure puts the
//! original tree back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use keel_core::{canonical_bytes, DetachedSignature, Envelope, Hash, KeyStore};
use keel_persist::{AgentHome, PILLARS};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::naming::{is_vault, AgentInfo, StampClock};
use crate::seed::{quarantine, recipient_set, Rejected};
use crate::transport::{Namespace, Transport};

pub const VAULT_VERSION: &str = "1.0";

const RESTORE_PREFIX: &str = ".restore-";
const PRIVATE_KEY: &str = "identity/agent.key";
const IDENTITY: &str = "identity/identity.json";
const PEERS: &str = "identity/peers/";

/// One file of the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Relative to the agent home, `/`-separated
    pub path: String,
    pub sha256: String,
    /// Base64 file contents
    pub content: String,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            path: path.into(),
            sha256: Hash::digest(bytes).to_hex(),
            content: STANDARD.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, SyncError> {
        STANDARD
            .decode(&self.content)
            .map_err(|e| SyncError::Malformed(format!("{}: {}", self.path, e)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultArchive {
    pub entries: Vec<ArchiveEntry>,
}

impl VaultArchive {
    /// Walk the agent home and collect every file a vault carries
    pub async fn pack(root: &Path) -> Result<Self, SyncError> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || Self::pack_blocking(&root))
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    }

    fn pack_blocking(root: &Path) -> Result<Self, SyncError> {
        let mut entries = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.path()
                    .strip_prefix(root)
                    .map(|rel| rel.as_os_str().is_empty() || !is_excluded(rel))
                    .unwrap_or(false)
            });

        for entry in walker {
            let entry = entry.map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| SyncError::Malformed(e.to_string()))?;
            let bytes = std::fs::read(entry.path())?;
            entries.push(ArchiveEntry::new(slash_path(rel), &bytes));
        }
        Ok(Self { entries })
    }

    pub fn file_hashes(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.path.clone(), e.sha256.clone()))
            .collect()
    }

    /// Pillars with at least one file in the archive
    pub fn pillars_included(&self) -> Vec<String> {
        PILLARS
            .iter()
            .filter(|p| {
                self.entries
                    .iter()
                    .any(|e| e.path.split('/').next() == Some(**p))
            })
            .map(|p| p.to_string())
            .collect()
    }
}

/// Cleartext description of a vault, covered by its signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultManifest {
    pub agent: String,
    pub host: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    pub pillars_included: Vec<String>,
    pub file_hashes: BTreeMap<String, String>,
    /// SHA-256 of the canonical archive bytes inside the envelope
    pub archive_hash: String,
}

/// What a vault file contains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultBlob {
    pub vault_version: String,
    pub manifest: VaultManifest,
    pub envelope: Envelope,
    pub signature: DetachedSignature,
}

#[derive(Serialize)]
struct SignedPart<'a> {
    manifest: &'a VaultManifest,
    envelope_digest: String,
}

fn signing_bytes(manifest: &VaultManifest, envelope: &Envelope) -> Result<Vec<u8>, SyncError> {
    let envelope_digest = Hash::of_canonical(envelope)
        .map_err(|e| SyncError::Malformed(e.to_string()))?
        .to_hex();
    canonical_bytes(&SignedPart {
        manifest,
        envelope_digest,
    })
    .map_err(|e| SyncError::Malformed(e.to_string()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub files: usize,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultPullReport {
    pub restored: Option<(String, RestoreReport)>,
    /// Verified but older than the one restored
    pub superseded: Vec<String>,
    pub duplicates: Vec<String>,
    pub rejected: Vec<Rejected>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultListing {
    pub name: String,
    pub namespace: Namespace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStatus {
    pub outbox: usize,
    pub inbox: usize,
    pub archived: usize,
    pub rejected: usize,
    pub latest: Option<String>,
}

pub struct VaultService {
    keys: Arc<KeyStore>,
    home: AgentHome,
    agent: AgentInfo,
    recipients: Vec<String>,
    clock: StampClock,
}

impl VaultService {
    pub fn new(keys: Arc<KeyStore>, home: AgentHome, agent: AgentInfo, recipients: Vec<String>) -> Self {
        Self {
            keys,
            home,
            agent,
            recipients,
            clock: StampClock::new(),
        }
    }

    pub async fn pack(&self) -> Result<VaultArchive, SyncError> {
        VaultArchive::pack(self.home.root()).await
    }

    /// Encrypt the archive, then sign manifest plus envelope
    pub fn seal(&self, archive: &VaultArchive, at: DateTime<Utc>) -> Result<VaultBlob, SyncError> {
        let bytes = canonical_bytes(archive).map_err(|e| SyncError::Malformed(e.to_string()))?;
        let manifest = VaultManifest {
            agent: self.agent.name.clone(),
            host: self.agent.host.clone(),
            user: self.agent.user.clone(),
            created_at: at,
            fingerprint: self.keys.fingerprint().to_string(),
            pillars_included: archive.pillars_included(),
            file_hashes: archive.file_hashes(),
            archive_hash: Hash::digest(&bytes).to_hex(),
        };
        let envelope = self
            .keys
            .encrypt_for(&bytes, &recipient_set(&self.keys, &self.recipients)?)?;
        let signature = self.keys.sign(&signing_bytes(&manifest, &envelope)?);

        Ok(VaultBlob {
            vault_version: VAULT_VERSION.to_string(),
            manifest,
            envelope,
            signature,
        })
    }

    /// Verify the signature, then decrypt, then check every hash
    pub fn open(&self, bytes: &[u8]) -> Result<(VaultManifest, VaultArchive), SyncError> {
        let blob: VaultBlob =
            serde_json::from_slice(bytes).map_err(|e| SyncError::Malformed(e.to_string()))?;
        if blob.vault_version != VAULT_VERSION {
            return Err(SyncError::Malformed(format!(
                "unsupported vault version {}",
                blob.vault_version
            )));
        }

        let claimed = &blob.manifest.fingerprint;
        if !blob.signature.signer.eq_ignore_ascii_case(claimed) {
            return Err(keel_core::CryptoError::InvalidSignature(format!(
                "vault claims {} but is signed by {}",
                claimed, blob.signature.signer
            ))
            .into());
        }
        let key = self
            .keys
            .verifying_key_for(claimed)
            .ok_or_else(|| SyncError::UnknownSender(claimed.clone()))?;
        blob.signature
            .verify(&signing_bytes(&blob.manifest, &blob.envelope)?, &key)?;

        let plaintext = self.keys.decrypt(&blob.envelope)?;
        if Hash::digest(&plaintext).to_hex() != blob.manifest.archive_hash {
            return Err(SyncError::Malformed("archive hash mismatch".into()));
        }
        let archive: VaultArchive =
            serde_json::from_slice(&plaintext).map_err(|e| SyncError::Malformed(e.to_string()))?;

        if archive.file_hashes() != blob.manifest.file_hashes {
            return Err(SyncError::Malformed(
                "archive entries do not match manifest".into(),
            ));
        }
        for entry in &archive.entries {
            entry_path(&entry.path)?;
            if Hash::digest(&entry.decode()?).to_hex() != entry.sha256 {
                return Err(SyncError::Malformed(format!("hash mismatch for {}", entry.path)));
            }
        }
        Ok((blob.manifest, archive))
    }

    pub async fn push(&self, transport: &dyn Transport) -> Result<String, SyncError> {
        self.push_at(transport, Utc::now()).await
    }

    pub async fn push_at(&self, transport: &dyn Transport, now: DateTime<Utc>) -> Result<String, SyncError> {
        let outbox = transport.list_namespace(Namespace::Outbox).await?;
        let mut stamp = self.clock.next(now).await;
        let mut name = self.agent.vault_name(stamp);
        while outbox.contains(&name) {
            stamp = self.clock.bump_past(stamp).await;
            name = self.agent.vault_name(stamp);
        }

        let archive = self.pack().await?;
        let blob = self.seal(&archive, stamp)?;
        let bytes = serde_json::to_vec(&blob).map_err(|e| SyncError::Malformed(e.to_string()))?;
        transport.put_outbox(&name, &bytes).await?;
        info!(
            backend = transport.name(),
            name = %name,
            files = archive.entries.len(),
            "Pushed vault"
        );
        Ok(name)
    }

    /// Replace local state with the archive contents, all or nothing.
    ///
    /// The local private key and public identity are kept, peers known only
    /// locally are kept, and append-only logs are unioned so revocations are
    /// never lost.
    pub async fn restore(&self, archive: &VaultArchive) -> Result<RestoreReport, SyncError> {
        let mut files = Vec::with_capacity(archive.entries.len());
        for entry in &archive.entries {
            files.push((entry_path(&entry.path)?, entry.decode()?));
        }

        let root = self.home.root().to_path_buf();
        fs::create_dir_all(&root).await?;
        let tag = Uuid::new_v4().simple().to_string();
        let staging = root.join(format!("{RESTORE_PREFIX}staging-{tag}"));
        let backup = root.join(format!("{RESTORE_PREFIX}backup-{tag}"));

        let components: Vec<String> = files
            .iter()
            .filter_map(|(p, _)| p.components().next())
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if let Err(e) = stage(&root, &staging, &files, &components).await {
            let _ = fs::remove_dir_all(&staging).await;
            warn!(error = %e, "Vault staging failed, live tree untouched");
            return Err(SyncError::PartialRestore(format!("staging failed: {e}")));
        }
        // a vault from a peer lists us as one of its peers
        let own_peer = Path::new(PEERS).join(format!("{}.json", self.keys.fingerprint().to_uppercase()));
        let _ = fs::remove_file(staging.join(own_peer)).await;

        if let Err(failure) = swap(&root, &staging, &backup, &components).await {
            return Err(abandon_swap(&staging, &backup, failure).await);
        }

        let _ = fs::remove_dir_all(&staging).await;
        if let Err(e) = fs::remove_dir_all(&backup).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %backup.display(), error = %e, "Could not remove restore backup");
            }
        }
        info!(files = files.len(), ?components, "Restored vault");
        Ok(RestoreReport {
            files: files.len(),
            components,
        })
    }

    /// Restore the newest verified vault in the inbox.
    ///
    /// Older verified vaults are archived unapplied. A vault that cannot be
    /// applied is quarantined like any other faulty artifact.
    pub async fn pull(&self, transport: &dyn Transport) -> Result<VaultPullReport, SyncError> {
        let mut report = VaultPullReport::default();
        let mut verified: Vec<(DateTime<Utc>, String, VaultArchive)> = Vec::new();

        for name in transport.list_inbox().await? {
            if !is_vault(&name) {
                continue;
            }
            if transport.is_archived(&name).await? {
                transport.archive(&name).await?;
                report.duplicates.push(name);
                continue;
            }

            let bytes = transport.get_inbox(&name).await?;
            match self.open(&bytes) {
                Ok((manifest, archive)) => verified.push((manifest.created_at, name, archive)),
                Err(e) if e.is_artifact_fault() => {
                    report.rejected.push(quarantine(transport, &name, &e).await?);
                }
                Err(e) => return Err(e),
            }
        }

        verified.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        let Some((_, newest, archive)) = verified.pop() else {
            return Ok(report);
        };

        match self.restore(&archive).await {
            Ok(restored) => {
                transport.archive(&newest).await?;
                report.restored = Some((newest, restored));
            }
            Err(e @ SyncError::PartialRestore(_)) => {
                report.rejected.push(quarantine(transport, &newest, &e).await?);
            }
            Err(e) => return Err(e),
        }

        for (_, name, _) in verified {
            transport.archive(&name).await?;
            debug!(name = %name, "Archived superseded vault");
            report.superseded.push(name);
        }
        Ok(report)
    }

    /// Vaults in the outbox, inbox and archive
    pub async fn list(&self, transport: &dyn Transport) -> Result<Vec<VaultListing>, SyncError> {
        let mut listings = Vec::new();
        for namespace in [Namespace::Outbox, Namespace::Inbox, Namespace::Archive] {
            for name in transport.list_namespace(namespace).await? {
                if is_vault(&name) {
                    listings.push(VaultListing { name, namespace });
                }
            }
        }
        Ok(listings)
    }

    pub async fn status(&self, transport: &dyn Transport) -> Result<VaultStatus, SyncError> {
        let vaults = |names: Vec<String>| -> Vec<String> { names.into_iter().filter(|n| is_vault(n)).collect() };
        let outbox = vaults(transport.list_namespace(Namespace::Outbox).await?);
        let inbox = vaults(transport.list_namespace(Namespace::Inbox).await?);
        let archived = vaults(transport.list_namespace(Namespace::Archive).await?);
        let rejected = vaults(transport.list_namespace(Namespace::Rejected).await?);

        // names sort by timestamp within one device only, so compare stamps
        let latest = outbox
            .iter()
            .chain(archived.iter())
            .max_by_key(|n| stamp_of(n))
            .cloned();

        Ok(VaultStatus {
            outbox: outbox.len(),
            inbox: inbox.len(),
            archived: archived.len(),
            rejected: rejected.len(),
            latest,
        })
    }
}

/// The `YYYYMMDDTHHMMSSZ` part of a vault name
fn stamp_of(name: &str) -> &str {
    name.trim_end_matches(crate::naming::VAULT_SUFFIX)
        .rsplit('-')
        .next()
        .unwrap_or_default()
}

/// Paths a vault never carries or restores over
fn is_excluded(rel: &Path) -> bool {
    let mut parts = rel.components().map(|c| c.as_os_str().to_string_lossy());
    let Some(first) = parts.next() else {
        return true;
    };
    if first == "sync" || first == "vault" || first.starts_with('.') {
        return true;
    }
    if parts.any(|p| p.starts_with('.')) {
        return true;
    }
    slash_path(rel) == PRIVATE_KEY
}

fn slash_path(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Turn an archive path into a safe relative path
fn entry_path(rel: &str) -> Result<PathBuf, SyncError> {
    let mut out = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => out.push(part),
            _ => return Err(SyncError::Malformed(format!("illegal path in vault: {rel}"))),
        }
    }
    if out.as_os_str().is_empty() || is_excluded(&out) {
        return Err(SyncError::Malformed(format!("illegal path in vault: {rel}")));
    }
    Ok(out)
}

/// Write every entry under `staging`, then carry over what must survive a
/// restore from the live tree.
async fn stage(
    root: &Path,
    staging: &Path,
    files: &[(PathBuf, Vec<u8>)],
    components: &[String],
) -> std::io::Result<()> {
    fs::create_dir_all(staging).await?;
    for (rel, bytes) in files {
        let target = staging.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, bytes).await?;
    }

    for component in components {
        let live = root.join(component);
        if !fs::metadata(&live).await.map(|m| m.is_dir()).unwrap_or(false) {
            continue;
        }
        for rel in list_files(root.to_path_buf(), live).await? {
            let path = slash_path(&rel);
            let from = root.join(&rel);
            let to = staging.join(&rel);

            if path == PRIVATE_KEY || path == IDENTITY {
                copy_file(&from, &to).await?;
            } else if path.ends_with(".jsonl") {
                union_lines(&from, &to).await?;
            } else if path.starts_with(PEERS) && !fs::try_exists(&to).await? {
                copy_file(&from, &to).await?;
            }
        }
    }
    Ok(())
}

async fn list_files(root: PathBuf, dir: PathBuf) -> std::io::Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || {
        let mut out = Vec::new();
        for entry in WalkDir::new(&dir) {
            let entry = entry.map_err(std::io::Error::other)?;
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(&root) {
                    out.push(rel.to_path_buf());
                }
            }
        }
        Ok(out)
    })
    .await
    .map_err(std::io::Error::other)?
}

async fn copy_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::copy(from, to).await?;
    Ok(())
}

/// Append live log lines missing from the staged copy
async fn union_lines(live: &Path, staged: &Path) -> std::io::Result<()> {
    let incoming = match fs::read_to_string(staged).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    let local = fs::read_to_string(live).await?;

    let mut seen = BTreeSet::new();
    let mut lines = Vec::new();
    for line in incoming.lines().chain(local.lines()) {
        let line = line.trim();
        // torn tails are dropped
        if line.is_empty() || serde_json::from_str::<serde_json::Value>(line).is_err() {
            continue;
        }
        if seen.insert(line.to_string()) {
            lines.push(line);
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    if let Some(parent) = staged.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(staged, out).await
}

/// A swap that stopped part way
#[derive(Debug)]
struct SwapFailure {
    error: std::io::Error,
    /// Set when the original tree could not be put back either
    rollback: Option<std::io::Error>,
}

/// Move each staged component into place, keeping the old one in `backup`.
/// On failure everything already moved is put back.
async fn swap(root: &Path, staging: &Path, backup: &Path, components: &[String]) -> Result<(), SwapFailure> {
    if let Err(error) = fs::create_dir_all(backup).await {
        return Err(SwapFailure { error, rollback: None });
    }
    let mut moved: Vec<(String, bool)> = Vec::new();
    for component in components {
        if let Err(error) = swap_one(root, staging, backup, component, &mut moved).await {
            let rollback = rollback(root, backup, &moved).await.err();
            return Err(SwapFailure { error, rollback });
        }
    }
    Ok(())
}

async fn swap_one(
    root: &Path,
    staging: &Path,
    backup: &Path,
    component: &str,
    moved: &mut Vec<(String, bool)>,
) -> std::io::Result<()> {
    let live = root.join(component);
    let had_live = fs::try_exists(&live).await?;
    if had_live {
        fs::rename(&live, backup.join(component)).await?;
    }
    moved.push((component.to_string(), had_live));
    fs::rename(staging.join(component), &live).await
}

/// Put moved components back from `backup`. Keeps going past failures and
/// returns the first one.
async fn rollback(root: &Path, backup: &Path, moved: &[(String, bool)]) -> std::io::Result<()> {
    let mut first: Option<std::io::Error> = None;
    for (component, had_live) in moved.iter().rev() {
        let live = root.join(component);
        let removed = match fs::metadata(&live).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&live).await,
            Ok(_) => fs::remove_file(&live).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            warn!(component = %component, error = %e, "Rollback could not clear component");
            first.get_or_insert(e);
        }
        if *had_live {
            if let Err(e) = fs::rename(backup.join(component), &live).await {
                warn!(component = %component, error = %e, "Rollback could not restore component");
                first.get_or_insert(e);
            }
        }
    }
    first.map_or(Ok(()), Err)
}

/// Clean up after a failed swap. The backup is deleted only when the
/// original tree is back in place; otherwise it holds the only copy.
async fn abandon_swap(staging: &Path, backup: &Path, failure: SwapFailure) -> SyncError {
    let _ = fs::remove_dir_all(staging).await;
    match failure.rollback {
        None => {
            let _ = fs::remove_dir_all(backup).await;
            warn!(error = %failure.error, "Vault swap failed, rolled back");
            SyncError::PartialRestore(format!("swap failed: {}", failure.error))
        }
        Some(rollback) => {
            error!(
                backup = %backup.display(),
                error = %failure.error,
                rollback_error = %rollback,
                "Vault swap and rollback failed, original files left in backup"
            );
            SyncError::PartialRestore(format!(
                "swap failed: {}; rollback failed: {}; original files kept in {}",
                failure.error,
                rollback,
                backup.display()
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn seeded_home(root: &Path) -> (AgentHome, Arc<KeyStore>) {
        let home = AgentHome::new(root);
        home.ensure().await.unwrap();
        let keys = Arc::new(KeyStore::generate("Opus", Utc::now()));
        fs::write(home.private_key(), b"secret").await.unwrap();
        fs::write(home.memory_summary(), br#"{"total":1}"#).await.unwrap();
        fs::write(home.sync_config(), b"{}").await.unwrap();
        fs::write(home.root().join("memory").join(".summary.json.tmp"), b"x")
            .await
            .unwrap();
        (home, keys)
    }

    #[tokio::test]
    async fn test_pack_skips_key_staging_and_hidden_files() {
        let dir = tempdir().unwrap();
        let (home, _) = seeded_home(dir.path()).await;
        let archive = VaultArchive::pack(home.root()).await.unwrap();
        let paths: Vec<_> = archive.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["memory/summary.json"]);
        assert_eq!(archive.pillars_included(), vec!["memory"]);
    }

    #[tokio::test]
    async fn test_tampered_envelope_fails_signature_before_decrypt() {
        let dir = tempdir().unwrap();
        let (home, keys) = seeded_home(dir.path()).await;
        let svc = VaultService::new(keys, home, AgentInfo::new("Opus", "alice", "laptop"), Vec::new());

        let archive = svc.pack().await.unwrap();
        let mut blob = svc.seal(&archive, Utc::now()).unwrap();
        blob.envelope.ciphertext.push('A');
        let bytes = serde_json::to_vec(&blob).unwrap();
        assert!(matches!(
            svc.open(&bytes),
            Err(SyncError::Crypto(keel_core::CryptoError::InvalidSignature(_)))
        ));
    }

    #[test]
    fn test_entry_path_rejects_escapes() {
        for bad in ["../x", "/etc/passwd", "sync/config.json", "identity/agent.key", "memory/.x", ""] {
            assert!(entry_path(bad).is_err(), "{bad} should be rejected");
        }
        assert!(entry_path("memory/summary.json").is_ok());
    }

    #[tokio::test]
    async fn test_restore_unions_logs_and_keeps_local_identity() {
        let dir = tempdir().unwrap();
        let (home, keys) = seeded_home(dir.path()).await;
        fs::write(home.identity(), b"{\"local\":true}").await.unwrap();
        fs::write(home.revocations(), "{\"token_id\":\"a\"}\n").await.unwrap();
        let svc = VaultService::new(keys, home.clone(), AgentInfo::new("Opus", "alice", "laptop"), Vec::new());

        let archive = VaultArchive {
            entries: vec![
                ArchiveEntry::new("identity/identity.json", b"{\"local\":false}"),
                ArchiveEntry::new("security/revoked.jsonl", b"{\"token_id\":\"b\"}\n"),
            ],
        };
        let report = svc.restore(&archive).await.unwrap();
        assert_eq!(report.components, vec!["identity", "security"]);

        assert_eq!(fs::read(home.private_key()).await.unwrap(), b"secret");
        assert_eq!(fs::read(home.identity()).await.unwrap(), b"{\"local\":true}");
        let revoked = fs::read_to_string(home.revocations()).await.unwrap();
        assert!(revoked.contains("\"a\"") && revoked.contains("\"b\""));
        // no staging or backup directories left behind
        let leftovers: Vec<_> = std::fs::read_dir(home.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(RESTORE_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_swap_rolls_back_and_drops_backup() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let (staging, backup) = (root.join(".restore-staging-t"), root.join(".restore-backup-t"));
        std::fs::create_dir_all(root.join("memory")).unwrap();
        std::fs::write(root.join("memory").join("summary.json"), b"old").unwrap();
        std::fs::create_dir_all(staging.join("memory")).unwrap();
        std::fs::write(staging.join("memory").join("summary.json"), b"new").unwrap();

        // "trust" was never staged, so its rename fails after "memory" moved
        let components = vec!["memory".to_string(), "trust".to_string()];
        let failure = swap(root, &staging, &backup, &components).await.unwrap_err();
        assert!(failure.rollback.is_none());
        assert_eq!(std::fs::read(root.join("memory").join("summary.json")).unwrap(), b"old");

        let err = abandon_swap(&staging, &backup, failure).await;
        assert!(matches!(err, SyncError::PartialRestore(_)));
        assert!(!backup.exists());
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_rollback_reports_missing_backup() {
        let dir = tempdir().unwrap();
        let backup = dir.path().join(".restore-backup-t");
        std::fs::create_dir_all(&backup).unwrap();
        let moved = vec![("memory".to_string(), true)];
        assert!(rollback(dir.path(), &backup, &moved).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_backup() {
        let dir = tempdir().unwrap();
        let (staging, backup) = (dir.path().join(".restore-staging-t"), dir.path().join(".restore-backup-t"));
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(backup.join("memory")).unwrap();
        std::fs::write(backup.join("memory").join("summary.json"), b"only copy").unwrap();

        let failure = SwapFailure {
            error: std::io::Error::other("rename failed"),
            rollback: Some(std::io::Error::other("rename back failed")),
        };
        let err = abandon_swap(&staging, &backup, failure).await;
        match err {
            SyncError::PartialRestore(detail) => {
                assert!(detail.contains("rollback failed"));
                assert!(detail.contains(&backup.display().to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            std::fs::read(backup.join("memory").join("summary.json")).unwrap(),
            b"only copy"
        );
        assert!(!staging.exists());
    }
}
