//! Agent identity and key material
//!
//! An agent holds two keypairs: Ed25519 for signing and X25519 for
//! receiving encrypted envelopes. The public half of both, plus a
//! fingerprint derived from the signing key, forms a [`PublicIdentity`]
//! that can be shared with peers. The private half never leaves the device.

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::hash::canonical_bytes;
use crate::signature::DetachedSignature;

/// Derive the fingerprint of a signing key: upper-case hex of the first
/// 20 bytes of SHA-256 over the raw public key.
pub fn fingerprint_of(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode_upper(&digest[..20])
}

/// Private key pair held by the local agent
pub struct AgentKeys {
    signing: SigningKey,
    encryption: StaticSecret,
}

impl AgentKeys {
    /// Generate a fresh keypair from the OS RNG
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            encryption: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_material(material: &KeyMaterial) -> Result<Self, CryptoError> {
        let signing = decode_32(&material.signing_key, "signing key")?;
        let encryption = decode_32(&material.encryption_key, "encryption key")?;
        Ok(Self {
            signing: SigningKey::from_bytes(&signing),
            encryption: StaticSecret::from(encryption),
        })
    }

    /// Export private material for local persistence only
    pub fn to_material(&self) -> KeyMaterial {
        KeyMaterial {
            signing_key: hex::encode(self.signing.to_bytes()),
            encryption_key: hex::encode(self.encryption.to_bytes()),
        }
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn encryption_public(&self) -> X25519PublicKey {
        X25519PublicKey::from(&self.encryption)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.verifying_key())
    }

    /// Build the shareable identity for these keys
    pub fn public_identity(&self, name: &str, created_at: DateTime<Utc>) -> PublicIdentity {
        PublicIdentity {
            name: name.to_string(),
            fingerprint: self.fingerprint(),
            signing_key: hex::encode(self.verifying_key().to_bytes()),
            encryption_key: hex::encode(self.encryption_public().as_bytes()),
            created_at,
        }
    }
}

impl std::fmt::Debug for AgentKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentKeys")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Hex-encoded private key material as written to `identity/agent.key`
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    pub signing_key: String,
    pub encryption_key: String,
}

/// Public half of an identity: what peers store and what tokens name as issuer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    pub name: String,
    pub fingerprint: String,
    /// Hex-encoded Ed25519 public key
    pub signing_key: String,
    /// Hex-encoded X25519 public key
    pub encryption_key: String,
    pub created_at: DateTime<Utc>,
}

impl PublicIdentity {
    pub fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        let bytes = decode_32(&self.signing_key, "signing key")?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn encryption_public(&self) -> Result<X25519PublicKey, CryptoError> {
        Ok(X25519PublicKey::from(decode_32(
            &self.encryption_key,
            "encryption key",
        )?))
    }

    /// Check that the fingerprint really belongs to the signing key and that
    /// both keys decode.
    pub fn validate(&self) -> Result<(), CryptoError> {
        let key = self.verifying_key()?;
        self.encryption_public()?;
        let expected = fingerprint_of(&key);
        if expected
            .as_bytes()
            .ct_eq(self.fingerprint.to_uppercase().as_bytes())
            .into()
        {
            Ok(())
        } else {
            Err(CryptoError::InvalidKey(format!(
                "fingerprint {} does not match signing key",
                self.fingerprint
            )))
        }
    }

    /// Case-insensitive fingerprint comparison
    pub fn matches(&self, fingerprint: &str) -> bool {
        self.fingerprint.eq_ignore_ascii_case(fingerprint)
    }
}

/// Audited key rotation: the old key vouches for the new one and the new key
/// acknowledges the old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationRecord {
    pub old_fingerprint: String,
    pub new_fingerprint: String,
    pub rotated_at: DateTime<Utc>,
    pub signature_by_old: DetachedSignature,
    pub signature_by_new: DetachedSignature,
}

#[derive(Serialize)]
struct RotationStatement<'a> {
    old_fingerprint: &'a str,
    new_fingerprint: &'a str,
    rotated_at: &'a DateTime<Utc>,
}

impl RotationRecord {
    pub fn create(old: &AgentKeys, new: &AgentKeys, rotated_at: DateTime<Utc>) -> Result<Self, CryptoError> {
        let old_fingerprint = old.fingerprint();
        let new_fingerprint = new.fingerprint();
        let message = canonical_bytes(&RotationStatement {
            old_fingerprint: &old_fingerprint,
            new_fingerprint: &new_fingerprint,
            rotated_at: &rotated_at,
        })?;
        Ok(Self {
            signature_by_old: DetachedSignature::create(&old_fingerprint, &message, old.signing_key()),
            signature_by_new: DetachedSignature::create(&new_fingerprint, &message, new.signing_key()),
            old_fingerprint,
            new_fingerprint,
            rotated_at,
        })
    }

    pub fn verify(&self, old: &PublicIdentity, new: &PublicIdentity) -> Result<(), CryptoError> {
        if !old.matches(&self.old_fingerprint) || !new.matches(&self.new_fingerprint) {
            return Err(CryptoError::InvalidSignature(
                "rotation record names different keys".to_string(),
            ));
        }
        let message = canonical_bytes(&RotationStatement {
            old_fingerprint: &self.old_fingerprint,
            new_fingerprint: &self.new_fingerprint,
            rotated_at: &self.rotated_at,
        })?;
        self.signature_by_old.verify(&message, &old.verifying_key()?)?;
        self.signature_by_new.verify(&message, &new.verifying_key()?)
    }
}

fn decode_32(s: &str, what: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidKey(format!("{what}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{what}: expected 32 bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_shape() {
        let keys = AgentKeys::generate();
        let fp = keys.fingerprint();
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_material_roundtrip_preserves_identity() {
        let keys = AgentKeys::generate();
        let restored = AgentKeys::from_material(&keys.to_material()).unwrap();
        assert_eq!(keys.fingerprint(), restored.fingerprint());
        assert_eq!(
            keys.encryption_public().as_bytes(),
            restored.encryption_public().as_bytes()
        );
    }

    #[test]
    fn test_public_identity_validates() {
        let keys = AgentKeys::generate();
        let id = keys.public_identity("Opus", Utc::now());
        assert!(id.validate().is_ok());

        let mut forged = id.clone();
        forged.fingerprint = AgentKeys::generate().fingerprint();
        assert!(matches!(forged.validate(), Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_rotation_record_verifies() {
        let old = AgentKeys::generate();
        let new = AgentKeys::generate();
        let now = Utc::now();
        let record = RotationRecord::create(&old, &new, now).unwrap();
        let old_id = old.public_identity("a", now);
        let new_id = new.public_identity("a", now);
        assert!(record.verify(&old_id, &new_id).is_ok());
        assert!(record.verify(&new_id, &old_id).is_err());
    }
}
