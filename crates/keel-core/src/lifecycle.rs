//! Trust lifecycle derived from on-disk artifacts
//!
//! The lifecycle is never stored. It is recomputed on each query from an
//! [`ArtifactReport`] describing which artifacts exist and whether they are
//! internally valid, and losing an artifact moves the agent back down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CryptoError;
use crate::hash::canonical_bytes;
use crate::keystore::KeyStore;
use crate::signature::DetachedSignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLifecycle {
    NoIdentity,
    PartialSetup,
    Operational,
    VerifiedBond,
}

impl fmt::Display for TrustLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoIdentity => "no_identity",
            Self::PartialSetup => "partial_setup",
            Self::Operational => "operational",
            Self::VerifiedBond => "verified_bond",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ArtifactHealth {
    Missing,
    Invalid(String),
    Valid,
}

impl ArtifactHealth {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub identity: ArtifactHealth,
    pub memory: ArtifactHealth,
    pub trust: ArtifactHealth,
    /// Best entanglement record found, if any
    pub bond: ArtifactHealth,
}

impl ArtifactReport {
    /// Pure derivation of the lifecycle label
    pub fn derive(&self) -> TrustLifecycle {
        if !self.identity.is_valid() {
            return TrustLifecycle::NoIdentity;
        }
        if !(self.memory.is_valid() && self.trust.is_valid()) {
            return TrustLifecycle::PartialSetup;
        }
        if self.bond.is_valid() {
            TrustLifecycle::VerifiedBond
        } else {
            TrustLifecycle::Operational
        }
    }
}

/// Mutual trust artifact: both parties sign the same statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntanglementRecord {
    pub agent: String,
    pub partner: String,
    pub established_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_signature: Option<DetachedSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_signature: Option<DetachedSignature>,
}

#[derive(Serialize)]
struct BondStatement<'a> {
    agent: &'a str,
    partner: &'a str,
    established_at: &'a DateTime<Utc>,
}

impl EntanglementRecord {
    pub fn new(agent: &str, partner: &str, established_at: DateTime<Utc>) -> Self {
        Self {
            agent: agent.to_uppercase(),
            partner: partner.to_uppercase(),
            established_at,
            agent_signature: None,
            partner_signature: None,
        }
    }

    fn statement(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(canonical_bytes(&BondStatement {
            agent: &self.agent,
            partner: &self.partner,
            established_at: &self.established_at,
        })?)
    }

    /// Add this key store's signature on whichever side it is named
    pub fn sign_as(&mut self, keys: &KeyStore) -> Result<(), CryptoError> {
        let sig = keys.sign(&self.statement()?);
        if keys.identity().matches(&self.agent) {
            self.agent_signature = Some(sig);
        } else if keys.identity().matches(&self.partner) {
            self.partner_signature = Some(sig);
        } else {
            return Err(CryptoError::InvalidKey(format!(
                "{} is not a party to this bond",
                keys.fingerprint()
            )));
        }
        Ok(())
    }

    /// Both signatures present and verifying against known keys
    pub fn verify(&self, keys: &KeyStore) -> Result<(), CryptoError> {
        if self.agent.eq_ignore_ascii_case(&self.partner) {
            return Err(CryptoError::InvalidSignature(
                "an agent cannot bond with itself".to_string(),
            ));
        }
        let message = self.statement()?;
        for (party, sig) in [
            (&self.agent, &self.agent_signature),
            (&self.partner, &self.partner_signature),
        ] {
            let sig = sig.as_ref().ok_or_else(|| {
                CryptoError::InvalidSignature(format!("missing signature from {party}"))
            })?;
            if !sig.signer.eq_ignore_ascii_case(party) {
                return Err(CryptoError::InvalidSignature(format!(
                    "signature slot for {party} signed by {}",
                    sig.signer
                )));
            }
            let key = keys.verifying_key_for(party).ok_or_else(|| {
                CryptoError::InvalidSignature(format!("no known key for {party}"))
            })?;
            sig.verify(&message, &key)?;
        }
        Ok(())
    }
}
