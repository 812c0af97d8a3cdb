//! Local filesystem transport
//!
//! Keeps the four namespaces as directories under a staging root. An
//! optional shared folder (USB drive, NAS mount, Syncthing-watched folder)
//! carries blobs between devices: pushes are copied into it, and unseen
//! blobs found in it are surfaced in the inbox.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::transport::{validate_name, Namespace, RejectionRecord, Transport};

const REASON_SUFFIX: &str = ".reason.json";

#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
    shared: Option<PathBuf>,
    name: String,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shared: None,
            name: "local".to_string(),
        }
    }

    /// Exchange blobs through a shared folder
    pub fn with_shared(mut self, shared: impl Into<PathBuf>) -> Self {
        self.shared = Some(shared.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join(namespace.as_str())
    }

    async fn ensure(&self) -> Result<(), SyncError> {
        for ns in Namespace::ALL {
            fs::create_dir_all(self.dir(ns)).await?;
        }
        Ok(())
    }

    /// Copy every outbox blob into another transport's inbox, as a sneakernet
    /// or a replaying relay would.
    pub async fn deliver_outbox_to(&self, peer: &LocalTransport) -> Result<Vec<String>, SyncError> {
        let mut delivered = Vec::new();
        for name in self.list_namespace(Namespace::Outbox).await? {
            let bytes = fs::read(self.dir(Namespace::Outbox).join(&name)).await?;
            peer.put_inbox(&name, &bytes).await?;
            delivered.push(name);
        }
        Ok(delivered)
    }

    /// Place a blob in the inbox, as a transport does when it surfaces one
    pub async fn put_inbox(&self, name: &str, bytes: &[u8]) -> Result<(), SyncError> {
        validate_name(name)?;
        self.ensure().await?;
        write_new(&self.dir(Namespace::Inbox), name, bytes).await
    }

    /// Pull unseen blobs from the shared folder into the inbox
    async fn import_shared(&self) -> Result<usize, SyncError> {
        let Some(shared) = &self.shared else {
            return Ok(0);
        };
        if !shared.is_dir() {
            return Ok(0);
        }

        let mut seen: BTreeSet<String> = BTreeSet::new();
        for ns in Namespace::ALL {
            seen.extend(self.list_namespace(ns).await?);
        }

        let mut imported = 0;
        for name in list_dir(shared).await? {
            if seen.contains(&name) || validate_name(&name).is_err() {
                continue;
            }
            let bytes = fs::read(shared.join(&name)).await?;
            write_new(&self.dir(Namespace::Inbox), &name, &bytes).await?;
            imported += 1;
        }
        if imported > 0 {
            debug!(backend = %self.name, imported, "Surfaced blobs from shared folder");
        }
        Ok(imported)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_healthy(&self) -> bool {
        if self.ensure().await.is_err() {
            return false;
        }
        match &self.shared {
            Some(shared) => fs::create_dir_all(shared).await.is_ok(),
            None => true,
        }
    }

    async fn put_outbox(&self, name: &str, bytes: &[u8]) -> Result<(), SyncError> {
        validate_name(name)?;
        self.ensure().await?;
        write_new(&self.dir(Namespace::Outbox), name, bytes).await?;
        if let Some(shared) = &self.shared {
            fs::create_dir_all(shared).await?;
            write_new(shared, name, bytes).await?;
        }
        info!(backend = %self.name, name, bytes = bytes.len(), "Pushed blob");
        Ok(())
    }

    async fn list_inbox(&self) -> Result<Vec<String>, SyncError> {
        self.ensure().await?;
        self.import_shared().await?;
        self.list_namespace(Namespace::Inbox).await
    }

    async fn get_inbox(&self, name: &str) -> Result<Vec<u8>, SyncError> {
        validate_name(name)?;
        Ok(fs::read(self.dir(Namespace::Inbox).join(name)).await?)
    }

    async fn archive(&self, name: &str) -> Result<(), SyncError> {
        validate_name(name)?;
        self.ensure().await?;
        let from = self.dir(Namespace::Inbox).join(name);
        let to = self.dir(Namespace::Archive).join(name);
        if to.exists() {
            // replay of something already processed
            if from.exists() {
                fs::remove_file(&from).await?;
            }
            return Ok(());
        }
        fs::rename(&from, &to).await?;
        Ok(())
    }

    async fn reject(&self, name: &str, record: &RejectionRecord) -> Result<(), SyncError> {
        validate_name(name)?;
        self.ensure().await?;
        let rejected = self.dir(Namespace::Rejected);
        let reason = serde_json::to_vec_pretty(record)
            .map_err(|e| SyncError::Malformed(e.to_string()))?;
        write_new(&rejected, &format!("{name}{REASON_SUFFIX}"), &reason).await?;

        let from = self.dir(Namespace::Inbox).join(name);
        if from.exists() {
            fs::rename(&from, rejected.join(name)).await?;
        }
        Ok(())
    }

    async fn is_archived(&self, name: &str) -> Result<bool, SyncError> {
        validate_name(name)?;
        Ok(fs::try_exists(self.dir(Namespace::Archive).join(name)).await?)
    }

    async fn list_namespace(&self, namespace: Namespace) -> Result<Vec<String>, SyncError> {
        let names = list_dir(&self.dir(namespace)).await?;
        Ok(names
            .into_iter()
            .filter(|n| !(namespace == Namespace::Rejected && n.ends_with(REASON_SUFFIX)))
            .collect())
    }
}

/// Visible regular files in a directory, sorted
async fn list_dir(dir: &Path) -> Result<Vec<String>, SyncError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Write via a hidden temp name and rename, so the blob appears whole
pub(crate) async fn write_new(dir: &Path, name: &str, bytes: &[u8]) -> Result<(), SyncError> {
    let tmp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));
    let mut file = fs::File::create(&tmp).await?;
    tokio::io::AsyncWriteExt::write_all(&mut file, bytes).await?;
    file.sync_all().await?;
    drop(file);
    if let Err(e) = fs::rename(&tmp, dir.join(name)).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_core::ErrorKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_outbox_to_inbox_to_archive() {
        let dir = tempdir().unwrap();
        let a = LocalTransport::new(dir.path().join("a"));
        let b = LocalTransport::new(dir.path().join("b"));

        a.put_outbox("x.seed.json.enc", b"blob").await.unwrap();
        assert_eq!(a.deliver_outbox_to(&b).await.unwrap(), vec!["x.seed.json.enc"]);

        assert_eq!(b.list_inbox().await.unwrap(), vec!["x.seed.json.enc"]);
        assert_eq!(b.get_inbox("x.seed.json.enc").await.unwrap(), b"blob");
        b.archive("x.seed.json.enc").await.unwrap();
        assert!(b.is_archived("x.seed.json.enc").await.unwrap());
        assert!(b.list_inbox().await.unwrap().is_empty());

        // replay lands in the inbox again; archiving drops it
        a.deliver_outbox_to(&b).await.unwrap();
        b.archive("x.seed.json.enc").await.unwrap();
        assert!(b.list_inbox().await.unwrap().is_empty());
        assert_eq!(b.list_namespace(Namespace::Archive).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_writes_reason() {
        let dir = tempdir().unwrap();
        let t = LocalTransport::new(dir.path());
        t.put_inbox("bad.seed.json.enc", b"junk").await.unwrap();
        let record = RejectionRecord {
            name: "bad.seed.json.enc".into(),
            kind: ErrorKind::DecryptionFailed,
            detail: "not for us".into(),
            rejected_at: Utc::now(),
        };
        t.reject("bad.seed.json.enc", &record).await.unwrap();

        assert!(t.list_inbox().await.unwrap().is_empty());
        assert_eq!(
            t.list_namespace(Namespace::Rejected).await.unwrap(),
            vec!["bad.seed.json.enc"]
        );
        let reason = std::fs::read_to_string(
            t.dir(Namespace::Rejected).join("bad.seed.json.enc.reason.json"),
        )
        .unwrap();
        let parsed: RejectionRecord = serde_json::from_str(&reason).unwrap();
        assert_eq!(parsed.kind, ErrorKind::DecryptionFailed);
    }

    #[tokio::test]
    async fn test_shared_folder_exchange() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("usb");
        let a = LocalTransport::new(dir.path().join("a")).with_shared(&shared);
        let b = LocalTransport::new(dir.path().join("b")).with_shared(&shared);

        a.put_outbox("one.seed.json.enc", b"1").await.unwrap();
        // own pushes are not surfaced back
        assert!(a.list_inbox().await.unwrap().is_empty());
        assert_eq!(b.list_inbox().await.unwrap(), vec!["one.seed.json.enc"]);

        b.archive("one.seed.json.enc").await.unwrap();
        assert!(b.list_inbox().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_names() {
        let dir = tempdir().unwrap();
        let t = LocalTransport::new(dir.path());
        assert!(matches!(
            t.put_outbox("../escape", b"x").await,
            Err(SyncError::InvalidName(_))
        ));
    }
}
