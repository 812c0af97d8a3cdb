//! Replicated local state: memory summary, trust record, manifest, devices

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use keel_core::{MemorySummary, PillarStatus, StorageError, TrustSummary, Versioned};
use serde::{Deserialize, Serialize};

use crate::atomic::{read_json, write_json};
use crate::layout::AgentHome;

/// `manifest.json`: the agent's name and the status of each pillar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentManifest {
    pub name: String,
    #[serde(default)]
    pub pillars: BTreeMap<String, PillarStatus>,
    pub updated_at: DateTime<Utc>,
}

impl AgentManifest {
    pub fn new(name: &str, updated_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            pillars: BTreeMap::new(),
            updated_at,
        }
    }

    pub fn pillars_versioned(&self) -> Versioned<BTreeMap<String, PillarStatus>> {
        Versioned::new(self.pillars.clone(), self.updated_at)
    }

    pub fn set_pillars(&mut self, pillars: Versioned<BTreeMap<String, PillarStatus>>) {
        self.pillars = pillars.value;
        self.updated_at = pillars.updated_at;
    }
}

/// Last time each remote device was heard from, keyed `agent@user@host`
pub type DeviceMap = BTreeMap<String, DateTime<Utc>>;

/// Typed access to the state files replicated by seeds
#[derive(Debug, Clone)]
pub struct LocalState {
    home: AgentHome,
}

impl LocalState {
    pub fn new(home: AgentHome) -> Self {
        Self { home }
    }

    pub fn home(&self) -> &AgentHome {
        &self.home
    }

    pub async fn memory(&self) -> Result<Option<Versioned<MemorySummary>>, StorageError> {
        read_json(&self.home.memory_summary()).await
    }

    pub async fn write_memory(&self, value: &Versioned<MemorySummary>) -> Result<(), StorageError> {
        write_json(&self.home.memory_summary(), value).await
    }

    pub async fn trust(&self) -> Result<Option<Versioned<TrustSummary>>, StorageError> {
        read_json(&self.home.trust_record()).await
    }

    pub async fn write_trust(&self, value: &Versioned<TrustSummary>) -> Result<(), StorageError> {
        write_json(&self.home.trust_record(), value).await
    }

    pub async fn manifest(&self) -> Result<Option<AgentManifest>, StorageError> {
        read_json(&self.home.manifest()).await
    }

    pub async fn write_manifest(&self, value: &AgentManifest) -> Result<(), StorageError> {
        write_json(&self.home.manifest(), value).await
    }

    pub async fn devices(&self) -> Result<DeviceMap, StorageError> {
        Ok(read_json(&self.home.devices()).await?.unwrap_or_default())
    }

    /// Merge last-seen times by max. Returns `true` if anything moved forward.
    pub async fn record_device(&self, device: &str, seen_at: DateTime<Utc>) -> Result<bool, StorageError> {
        let mut devices = self.devices().await?;
        let advanced = match devices.get(device) {
            Some(prev) if *prev >= seen_at => false,
            _ => {
                devices.insert(device.to_string(), seen_at);
                true
            }
        };
        if advanced {
            write_json(&self.home.devices(), &devices).await?;
        }
        Ok(advanced)
    }
}
