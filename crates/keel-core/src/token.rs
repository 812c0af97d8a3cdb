//! Capability tokens
//!
//! A token is a signed, content-addressed grant of capabilities from an
//! issuer to a subject. The id is the SHA-256 of the canonical payload
//! without the id field, so any edit to the payload changes the id and
//! breaks the signature.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::hash::{canonical_bytes, Hash};
use crate::signature::DetachedSignature;

/// Version tag of the portable export format
pub const EXPORT_VERSION: &str = "1.0";

/// Closed set of grantable capabilities.
///
/// Variants are declared in lexical order of their wire names so that a
/// `BTreeSet<Capability>` serializes sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Wildcard: every capability
    #[serde(rename = "*")]
    All,
    #[serde(rename = "agent:connect")]
    AgentConnect,
    #[serde(rename = "agent:status")]
    AgentStatus,
    #[serde(rename = "audit:read")]
    AuditRead,
    #[serde(rename = "identity:sign")]
    IdentitySign,
    #[serde(rename = "identity:verify")]
    IdentityVerify,
    #[serde(rename = "memory:read")]
    MemoryRead,
    #[serde(rename = "memory:write")]
    MemoryWrite,
    #[serde(rename = "sync:pull")]
    SyncPull,
    #[serde(rename = "sync:push")]
    SyncPush,
    #[serde(rename = "token:issue")]
    TokenIssue,
    #[serde(rename = "trust:read")]
    TrustRead,
    #[serde(rename = "trust:write")]
    TrustWrite,
}

impl Capability {
    pub const ALL: [Capability; 13] = [
        Self::All,
        Self::AgentConnect,
        Self::AgentStatus,
        Self::AuditRead,
        Self::IdentitySign,
        Self::IdentityVerify,
        Self::MemoryRead,
        Self::MemoryWrite,
        Self::SyncPull,
        Self::SyncPush,
        Self::TokenIssue,
        Self::TrustRead,
        Self::TrustWrite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "*",
            Self::AgentConnect => "agent:connect",
            Self::AgentStatus => "agent:status",
            Self::AuditRead => "audit:read",
            Self::IdentitySign => "identity:sign",
            Self::IdentityVerify => "identity:verify",
            Self::MemoryRead => "memory:read",
            Self::MemoryWrite => "memory:write",
            Self::SyncPull => "sync:pull",
            Self::SyncPush => "sync:push",
            Self::TokenIssue => "token:issue",
            Self::TrustRead => "trust:read",
            Self::TrustWrite => "trust:write",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AuthError::MalformedPayload(format!("unknown capability '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Agent,
    #[default]
    Capability,
    Delegation,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Agent => "agent",
            Self::Capability => "capability",
            Self::Delegation => "delegation",
        })
    }
}

impl FromStr for TokenType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(Self::Agent),
            "capability" => Ok(Self::Capability),
            "delegation" => Ok(Self::Delegation),
            other => Err(AuthError::MalformedPayload(format!(
                "unknown token type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub token_id: String,
    pub token_type: TokenType,
    /// Fingerprint of the issuing identity
    pub issuer: String,
    pub subject: String,
    pub capabilities: BTreeSet<Capability>,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Everything but the id, borrowed, for content addressing
#[derive(Serialize)]
struct IdParams<'a> {
    token_type: TokenType,
    issuer: &'a str,
    subject: &'a str,
    capabilities: &'a BTreeSet<Capability>,
    issued_at: &'a DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<&'a DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    not_before: Option<&'a DateTime<Utc>>,
    metadata: &'a BTreeMap<String, serde_json::Value>,
}

impl TokenPayload {
    /// Content address of this payload, ignoring the stored `token_id`
    pub fn compute_id(&self) -> Result<String, serde_json::Error> {
        let params = IdParams {
            token_type: self.token_type,
            issuer: &self.issuer,
            subject: &self.subject,
            capabilities: &self.capabilities,
            issued_at: &self.issued_at,
            expires_at: self.expires_at.as_ref(),
            not_before: self.not_before.as_ref(),
            metadata: &self.metadata,
        };
        Ok(Hash::of_canonical(&params)?.to_hex())
    }

    /// Bytes covered by the signature (full payload, id included)
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        canonical_bytes(self)
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.capabilities.contains(&Capability::All) || self.capabilities.contains(&capability)
    }

    pub fn is_expired_at(&self, t: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| t >= exp)
    }

    pub fn is_premature_at(&self, t: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|nbf| t < nbf)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedToken {
    pub payload: TokenPayload,
    pub signature: DetachedSignature,
}

#[derive(Serialize)]
struct ExportRef<'a> {
    keel_token: &'static str,
    payload: &'a TokenPayload,
    signature: &'a DetachedSignature,
}

#[derive(Deserialize)]
struct ExportOwned {
    keel_token: String,
    payload: TokenPayload,
    signature: DetachedSignature,
}

impl SignedToken {
    pub fn token_id(&self) -> &str {
        &self.payload.token_id
    }

    /// Portable JSON form
    pub fn to_export_json(&self) -> Result<String, AuthError> {
        serde_json::to_string_pretty(&ExportRef {
            keel_token: EXPORT_VERSION,
            payload: &self.payload,
            signature: &self.signature,
        })
        .map_err(|e| AuthError::MalformedPayload(e.to_string()))
    }

    /// Parse the portable JSON form. Never panics; anything that is not a
    /// well-formed token is `MalformedPayload`. Signatures are not checked
    /// here.
    pub fn from_export_json(json: &str) -> Result<Self, AuthError> {
        let parsed: ExportOwned =
            serde_json::from_str(json).map_err(|e| AuthError::MalformedPayload(e.to_string()))?;
        if parsed.keel_token != EXPORT_VERSION {
            return Err(AuthError::MalformedPayload(format!(
                "unsupported token format version '{}'",
                parsed.keel_token
            )));
        }
        if parsed.payload.capabilities.is_empty() {
            return Err(AuthError::MalformedPayload(
                "token grants no capabilities".to_string(),
            ));
        }
        Ok(Self {
            payload: parsed.payload,
            signature: parsed.signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_wire_names() {
        for cap in Capability::ALL {
            let json = serde_json::to_string(&cap).unwrap();
            assert_eq!(json, format!("\"{}\"", cap.as_str()));
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
    }

    #[test]
    fn test_unknown_capability_is_malformed() {
        assert!(matches!(
            "memory:delete".parse::<Capability>(),
            Err(AuthError::MalformedPayload(_))
        ));
        assert!(serde_json::from_str::<Capability>("\"root\"").is_err());
    }

    #[test]
    fn test_capabilities_serialize_sorted() {
        let caps: BTreeSet<_> = [Capability::TrustWrite, Capability::All, Capability::MemoryRead]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, r#"["*","memory:read","trust:write"]"#);
    }

    #[test]
    fn test_wildcard_grants_everything() {
        let payload = TokenPayload {
            token_id: String::new(),
            token_type: TokenType::Agent,
            issuer: "A".into(),
            subject: "B".into(),
            capabilities: [Capability::All].into_iter().collect(),
            issued_at: Utc::now(),
            expires_at: None,
            not_before: None,
            metadata: BTreeMap::new(),
        };
        assert!(Capability::ALL.iter().all(|c| payload.grants(*c)));
        assert!(!payload.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_id_ignores_stored_id() {
        let mut payload = TokenPayload {
            token_id: "x".into(),
            token_type: TokenType::Capability,
            issuer: "A".into(),
            subject: "Jarvis".into(),
            capabilities: [Capability::MemoryRead].into_iter().collect(),
            issued_at: Utc::now(),
            expires_at: None,
            not_before: None,
            metadata: BTreeMap::new(),
        };
        let id = payload.compute_id().unwrap();
        payload.token_id = id.clone();
        assert_eq!(payload.compute_id().unwrap(), id);

        payload.subject = "Friday".into();
        assert_ne!(payload.compute_id().unwrap(), id);
    }

    #[test]
    fn test_import_garbage_is_malformed() {
        for input in ["", "{}", "null", r#"{"keel_token":"9.9"}"#, "[1,2"] {
            assert!(matches!(
                SignedToken::from_export_json(input),
                Err(AuthError::MalformedPayload(_))
            ));
        }
    }
}
