//! Deterministic blob names
//!
//! Names embed agent, user, host and a UTC second. Together with a
//! per-process monotonic clock and a check against the outbox, no two blobs
//! from one device share a name, and the same blob keeps its name on every
//! device it reaches.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub const SEED_SUFFIX: &str = ".seed.json";
pub const SEALED_SUFFIX: &str = ".enc";
pub const VAULT_SUFFIX: &str = ".vault.json";

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Who produced a blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub user: String,
    pub host: String,
}

impl AgentInfo {
    pub fn new(name: impl Into<String>, user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user: user.into(),
            host: host.into(),
        }
    }

    /// Key for the device last-seen map
    pub fn device_key(&self) -> String {
        format!("{}@{}@{}", self.name, self.user, self.host)
    }

    fn stem(&self) -> String {
        format!(
            "{}-{}-{}",
            sanitize(&self.name),
            sanitize(&self.user),
            sanitize(&self.host)
        )
    }

    /// `{agent}-{user}-{host}-{ts}.seed.json`
    pub fn seed_name(&self, at: DateTime<Utc>) -> String {
        format!("{}-{}{SEED_SUFFIX}", self.stem(), at.format(STAMP_FORMAT))
    }

    /// `vault-{agent}-{user}-{host}-{ts}.vault.json`
    pub fn vault_name(&self, at: DateTime<Utc>) -> String {
        format!("vault-{}-{}{VAULT_SUFFIX}", self.stem(), at.format(STAMP_FORMAT))
    }
}

/// Keep a name component filesystem and separator safe
pub fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

pub fn is_sealed_seed(name: &str) -> bool {
    name.ends_with(&format!("{SEED_SUFFIX}{SEALED_SUFFIX}"))
}

pub fn is_vault(name: &str) -> bool {
    name.starts_with("vault-") && name.ends_with(VAULT_SUFFIX)
}

/// Hands out second-granularity timestamps that never repeat or go
/// backwards within a process.
#[derive(Debug, Default)]
pub struct StampClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl StampClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn next(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self.last.lock().await;
        let mut stamp = truncate_to_second(now);
        if let Some(prev) = *last {
            if stamp <= prev {
                stamp = prev + Duration::seconds(1);
            }
        }
        *last = Some(stamp);
        stamp
    }

    /// Advance past a stamp already taken elsewhere (for example by another
    /// process writing the same outbox)
    pub async fn bump_past(&self, taken: DateTime<Utc>) -> DateTime<Utc> {
        self.next(taken + Duration::seconds(1)).await
    }
}

pub fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::seconds(1)).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn opus() -> AgentInfo {
        AgentInfo::new("Opus", "alice", "laptop")
    }

    #[test]
    fn test_seed_name_shape() {
        let at = Utc.with_ymd_and_hms(2026, 2, 23, 2, 35, 52).unwrap();
        assert_eq!(opus().seed_name(at), "Opus-alice-laptop-20260223T023552Z.seed.json");
        assert_eq!(
            opus().vault_name(at),
            "vault-Opus-alice-laptop-20260223T023552Z.vault.json"
        );
        assert!(is_sealed_seed("Opus-alice-laptop-20260223T023552Z.seed.json.enc"));
        assert!(!is_sealed_seed("Opus-alice-laptop-20260223T023552Z.seed.json"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("alice's mac/book"), "alice_s_mac_book");
        assert_eq!(sanitize(""), "unknown");
    }

    #[tokio::test]
    async fn test_clock_never_repeats() {
        let clock = StampClock::new();
        let now = Utc.with_ymd_and_hms(2026, 2, 23, 2, 35, 52).unwrap();
        let a = clock.next(now).await;
        let b = clock.next(now).await;
        let c = clock.next(now - Duration::minutes(1)).await;
        assert!(a < b && b < c);
        assert_eq!(b - a, Duration::seconds(1));
    }
}
