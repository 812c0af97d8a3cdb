//! Git repository transport
//!
//! Sealed blobs are committed under `blobs/` in a working copy and,
//! when a remote is configured, pushed to it. Pulling fetches the remote and
//! surfaces any blob this device has not yet seen. Per-device namespaces
//! (inbox, archive, rejected) stay local in a staging directory.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::local::{write_new, LocalTransport};
use crate::transport::{validate_name, Namespace, RejectionRecord, Transport};

const BLOB_DIR: &str = "blobs";

#[derive(Debug, Clone)]
pub struct GitTransport {
    repo_path: PathBuf,
    branch: String,
    remote: Option<String>,
    staging: LocalTransport,
}

impl GitTransport {
    pub fn new(repo_path: impl Into<PathBuf>, staging: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            branch: "keel-sync".to_string(),
            remote: None,
            staging: LocalTransport::new(staging).with_name("git"),
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    /// Keep only characters that are harmless in a commit message
    fn sanitize_git_message(s: &str) -> String {
        s.chars()
            .filter(|c| c.is_alphanumeric() || " -_:.@".contains(*c))
            .take(200)
            .collect()
    }

    /// Run a git command and return stdout
    async fn git(&self, args: &[&str]) -> Result<String, SyncError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SyncError::Git(format!("Failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::Git(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Switch to the sync branch, creating it if needed
    async fn ensure_branch(&self) -> Result<(), SyncError> {
        let current = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await.unwrap_or_default();
        if current == self.branch {
            return Ok(());
        }

        let branches = self.git(&["branch", "--list", &self.branch]).await?;
        if branches.is_empty() {
            self.git(&["checkout", "-b", &self.branch]).await?;
        } else {
            self.git(&["checkout", &self.branch]).await?;
        }
        Ok(())
    }

    async fn pull_remote(&self) {
        let Some(remote) = &self.remote else {
            return;
        };
        if let Err(e) = self.git(&["pull", "--ff-only", remote, &self.branch]).await {
            // a fresh remote has no branch yet
            warn!(remote = %remote, error = %e, "git pull failed, using local copy");
        }
    }

    fn blob_dir(&self) -> PathBuf {
        self.repo_path.join(BLOB_DIR)
    }
}

#[async_trait]
impl Transport for GitTransport {
    fn name(&self) -> &str {
        "git"
    }

    async fn is_healthy(&self) -> bool {
        self.git(&["status", "--porcelain"]).await.is_ok() && self.staging.is_healthy().await
    }

    async fn put_outbox(&self, name: &str, bytes: &[u8]) -> Result<(), SyncError> {
        validate_name(name)?;
        self.staging.put_outbox(name, bytes).await?;

        self.ensure_branch().await?;
        fs::create_dir_all(self.blob_dir()).await?;
        write_new(&self.blob_dir(), name, bytes).await?;

        let rel = format!("{BLOB_DIR}/{name}");
        self.git(&["add", "--", &rel]).await?;
        let message = format!("keel: add {}", Self::sanitize_git_message(name));
        self.git(&["commit", "-m", &message, "--", &rel]).await?;

        if let Some(remote) = &self.remote {
            self.git(&["push", remote, &self.branch]).await?;
        }
        info!(backend = "git", name, "Committed blob");
        Ok(())
    }

    async fn list_inbox(&self) -> Result<Vec<String>, SyncError> {
        self.ensure_branch().await?;
        self.pull_remote().await;

        let mut seen = BTreeSet::new();
        for ns in Namespace::ALL {
            seen.extend(self.staging.list_namespace(ns).await?);
        }

        let mut entries = match fs::read_dir(self.blob_dir()).await {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(entries) = entries.as_mut() {
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if seen.contains(&name) || validate_name(&name).is_err() {
                    continue;
                }
                let bytes = fs::read(entry.path()).await?;
                self.staging.put_inbox(&name, &bytes).await?;
                debug!(name, "Surfaced blob from git");
            }
        }

        self.staging.list_inbox().await
    }

    async fn get_inbox(&self, name: &str) -> Result<Vec<u8>, SyncError> {
        self.staging.get_inbox(name).await
    }

    async fn archive(&self, name: &str) -> Result<(), SyncError> {
        self.staging.archive(name).await
    }

    async fn reject(&self, name: &str, record: &RejectionRecord) -> Result<(), SyncError> {
        self.staging.reject(name, record).await
    }

    async fn is_archived(&self, name: &str) -> Result<bool, SyncError> {
        self.staging.is_archived(name).await
    }

    async fn list_namespace(&self, namespace: Namespace) -> Result<Vec<String>, SyncError> {
        self.staging.list_namespace(namespace).await
    }
}
