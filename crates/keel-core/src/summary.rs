//! Replicated state groups and last-writer-wins merge

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hash::canonical_bytes;

/// Tier counts of the agent's memory store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySummary {
    pub total: u64,
    pub short_term: u64,
    pub mid_term: u64,
    pub long_term: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustSummary {
    pub depth: u32,
    pub trust_level: f64,
    pub feb_count: u64,
    pub entangled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PillarStatus {
    Active,
    Degraded,
    Missing,
    Error,
}

impl fmt::Display for PillarStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Missing => "missing",
            Self::Error => "error",
        })
    }
}

/// Outcome of merging one field group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    /// Incoming was newer and replaced the local value
    Applied,
    /// Local was newer
    Kept,
    /// Same timestamp, same content
    Unchanged,
    /// Same timestamp, different content. A deterministic winner was
    /// chosen, but the contradiction is surfaced to the caller.
    Conflict,
}

/// A field group stamped with the time it was last written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    #[serde(flatten)]
    pub value: T,
    pub updated_at: DateTime<Utc>,
}

impl<T> Versioned<T>
where
    T: Serialize + Clone + PartialEq,
{
    pub fn new(value: T, updated_at: DateTime<Utc>) -> Self {
        Self { value, updated_at }
    }

    /// Last-writer-wins merge.
    ///
    /// Ties on `updated_at` go to the value with the larger canonical
    /// encoding, so the outcome does not depend on arrival order. A value
    /// with no canonical encoding (a non-finite float) never wins a tie.
    pub fn merge(&mut self, incoming: &Versioned<T>) -> MergeDecision {
        if incoming.updated_at > self.updated_at {
            *self = incoming.clone();
            return MergeDecision::Applied;
        }
        if incoming.updated_at < self.updated_at {
            return MergeDecision::Kept;
        }
        if incoming.value == self.value {
            return MergeDecision::Unchanged;
        }

        let ours = canonical_bytes(&self.value).ok();
        let theirs = canonical_bytes(&incoming.value).ok();
        if theirs > ours {
            *self = incoming.clone();
        }
        MergeDecision::Conflict
    }
}
