//! In-memory key store: the local agent's keys plus known peer keys

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use tracing::info;

use crate::envelope::Envelope;
use crate::error::CryptoError;
use crate::identity::{AgentKeys, PublicIdentity, RotationRecord};
use crate::signature::DetachedSignature;

/// Holds the agent's private keys and every public key it trusts.
///
/// Lookups by fingerprint are case-insensitive; peers are keyed by the
/// upper-case fingerprint.
#[derive(Debug)]
pub struct KeyStore {
    keys: AgentKeys,
    identity: PublicIdentity,
    peers: BTreeMap<String, PublicIdentity>,
    /// Fingerprints of our own keys retired by rotation
    retired: BTreeSet<String>,
}

impl KeyStore {
    pub fn new(keys: AgentKeys, identity: PublicIdentity) -> Result<Self, CryptoError> {
        if !identity.matches(&keys.fingerprint()) {
            return Err(CryptoError::InvalidKey(format!(
                "identity {} does not belong to the loaded private key",
                identity.fingerprint
            )));
        }
        identity.validate()?;
        Ok(Self {
            keys,
            identity,
            peers: BTreeMap::new(),
            retired: BTreeSet::new(),
        })
    }

    /// Fresh identity with a new keypair
    pub fn generate(name: &str, now: DateTime<Utc>) -> Self {
        let keys = AgentKeys::generate();
        let identity = keys.public_identity(name, now);
        Self {
            keys,
            identity,
            peers: BTreeMap::new(),
            retired: BTreeSet::new(),
        }
    }

    pub fn identity(&self) -> &PublicIdentity {
        &self.identity
    }

    pub fn fingerprint(&self) -> &str {
        &self.identity.fingerprint
    }

    pub fn keys(&self) -> &AgentKeys {
        &self.keys
    }

    pub fn sign(&self, message: &[u8]) -> DetachedSignature {
        DetachedSignature::create(self.fingerprint(), message, self.keys.signing_key())
    }

    /// Find a public identity by fingerprint: ourselves first, then peers.
    pub fn lookup(&self, fingerprint: &str) -> Option<&PublicIdentity> {
        if self.identity.matches(fingerprint) {
            return Some(&self.identity);
        }
        self.peers.get(&fingerprint.to_uppercase())
    }

    pub fn verifying_key_for(&self, fingerprint: &str) -> Option<VerifyingKey> {
        self.lookup(fingerprint)?.verifying_key().ok()
    }

    /// Register a peer public key. Returns `true` when the peer was not known.
    pub fn add_peer(&mut self, peer: PublicIdentity) -> Result<bool, CryptoError> {
        peer.validate()?;
        if self.identity.matches(&peer.fingerprint) {
            return Err(CryptoError::InvalidKey(
                "cannot import our own identity as a peer".to_string(),
            ));
        }
        let key = peer.fingerprint.to_uppercase();
        let is_new = !self.peers.contains_key(&key);
        self.peers.insert(key, peer);
        Ok(is_new)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PublicIdentity> {
        self.peers.values()
    }

    pub fn mark_retired(&mut self, fingerprint: &str) {
        self.retired.insert(fingerprint.to_uppercase());
    }

    pub fn is_retired(&self, fingerprint: &str) -> bool {
        self.retired.contains(&fingerprint.to_uppercase())
    }

    /// Default recipient set: our own key plus every live peer key.
    /// Keys retired by our own rotations are skipped since nobody holds the
    /// matching secret any more.
    pub fn pairing_set(&self) -> Vec<PublicIdentity> {
        std::iter::once(self.identity.clone())
            .chain(
                self.peers
                    .values()
                    .filter(|p| !self.is_retired(&p.fingerprint))
                    .cloned(),
            )
            .collect()
    }

    /// Resolve fingerprints to identities, failing on the first unknown one
    pub fn resolve_recipients(&self, fingerprints: &[String]) -> Result<Vec<PublicIdentity>, CryptoError> {
        fingerprints
            .iter()
            .map(|fp| {
                self.lookup(fp)
                    .cloned()
                    .ok_or_else(|| CryptoError::InvalidKey(format!("unknown recipient {fp}")))
            })
            .collect()
    }

    pub fn encrypt_for(&self, payload: &[u8], recipients: &[PublicIdentity]) -> Result<Envelope, CryptoError> {
        Envelope::seal(payload, recipients)
    }

    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
        envelope.open(self.fingerprint(), self.keys.encryption_secret())
    }

    /// Replace our keypair with a fresh one.
    ///
    /// The old public identity stays in the peer map so that anything it
    /// signed before the rotation keeps verifying.
    pub fn rotate(&mut self, now: DateTime<Utc>) -> Result<RotationRecord, CryptoError> {
        let new_keys = AgentKeys::generate();
        let record = RotationRecord::create(&self.keys, &new_keys, now)?;

        let new_identity = new_keys.public_identity(&self.identity.name, now);
        let old_identity = std::mem::replace(&mut self.identity, new_identity);
        self.keys = new_keys;

        self.retired.insert(old_identity.fingerprint.to_uppercase());
        self.peers
            .insert(old_identity.fingerprint.to_uppercase(), old_identity);

        info!(
            old = %record.old_fingerprint,
            new = %record.new_fingerprint,
            "Rotated agent identity"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let store = KeyStore::generate("Opus", Utc::now());
        let fp = store.fingerprint().to_lowercase();
        assert!(store.lookup(&fp).is_some());
        assert!(store.lookup("DEADBEEF").is_none());
    }

    #[test]
    fn test_pairing_set_includes_self_and_peers() {
        let mut a = KeyStore::generate("laptop", Utc::now());
        let b = KeyStore::generate("desktop", Utc::now());
        assert!(a.add_peer(b.identity().clone()).unwrap());
        assert!(!a.add_peer(b.identity().clone()).unwrap());

        let set = a.pairing_set();
        assert_eq!(set.len(), 2);
        assert!(set.iter().any(|p| p.matches(b.fingerprint())));
    }

    #[test]
    fn test_rejects_self_as_peer() {
        let mut a = KeyStore::generate("laptop", Utc::now());
        let me = a.identity().clone();
        assert!(a.add_peer(me).is_err());
    }

    #[test]
    fn test_rotation_keeps_old_key_verifiable() {
        let mut store = KeyStore::generate("Opus", Utc::now());
        let old_fp = store.fingerprint().to_string();
        let sig = store.sign(b"before rotation");

        let record = store.rotate(Utc::now()).unwrap();
        assert_eq!(record.old_fingerprint, old_fp);
        assert_ne!(store.fingerprint(), old_fp);

        let old_key = store.verifying_key_for(&old_fp).unwrap();
        assert!(sig.verify(b"before rotation", &old_key).is_ok());
        // the retired key is not a recipient any more
        assert_eq!(store.pairing_set().len(), 1);
    }

    #[test]
    fn test_encrypt_decrypt_through_store() {
        let a = KeyStore::generate("laptop", Utc::now());
        let env = a.encrypt_for(b"summary", &a.pairing_set()).unwrap();
        assert_eq!(a.decrypt(&env).unwrap(), b"summary");
    }
}
