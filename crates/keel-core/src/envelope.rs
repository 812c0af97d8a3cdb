//! Hybrid multi-recipient encryption
//!
//! A random 256-bit content key seals the payload with AES-256-GCM. The
//! content key is then wrapped once per recipient: an ephemeral X25519
//! agreement with the recipient's static key, HKDF-SHA256 to a key
//! encryption key, and AES-256-GCM again. Any listed recipient can open the
//! envelope with their own secret; nobody else can.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::PublicIdentity;

pub const ENVELOPE_VERSION: u32 = 1;

const KDF_INFO: &[u8] = b"keel-envelope-v1";
const NONCE_LEN: usize = 12;

/// One wrapped copy of the content key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientStanza {
    pub fingerprint: String,
    /// Hex-encoded ephemeral X25519 public key
    pub ephemeral_key: String,
    /// Base64 of nonce || AES-GCM(kek, content_key)
    pub wrapped_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub version: u32,
    pub recipients: Vec<RecipientStanza>,
    pub nonce: String,
    pub ciphertext: String,
}

impl Envelope {
    /// Encrypt `payload` so that every identity in `recipients` can open it.
    pub fn seal(payload: &[u8], recipients: &[PublicIdentity]) -> Result<Self, CryptoError> {
        if recipients.is_empty() {
            return Err(CryptoError::NoRecipients);
        }

        let mut content_key = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut content_key[..]);

        let (nonce, ciphertext) = aead_seal(&content_key, payload)?;

        let mut stanzas = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let recipient_pub = recipient.encryption_public()?;
            let ephemeral = EphemeralSecret::random_from_rng(OsRng);
            let ephemeral_pub = X25519PublicKey::from(&ephemeral);
            let shared = ephemeral.diffie_hellman(&recipient_pub);
            if !shared.was_contributory() {
                return Err(CryptoError::InvalidKey(format!(
                    "recipient {} has a low-order encryption key",
                    recipient.fingerprint
                )));
            }

            let kek = derive_kek(shared.as_bytes(), &ephemeral_pub, &recipient_pub)?;
            let (wrap_nonce, wrapped) = aead_seal(&kek, &content_key[..])?;

            let mut wrapped_key = wrap_nonce.to_vec();
            wrapped_key.extend_from_slice(&wrapped);
            stanzas.push(RecipientStanza {
                fingerprint: recipient.fingerprint.clone(),
                ephemeral_key: hex::encode(ephemeral_pub.as_bytes()),
                wrapped_key: BASE64.encode(wrapped_key),
            });
        }

        Ok(Self {
            version: ENVELOPE_VERSION,
            recipients: stanzas,
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    /// Open with a local secret.
    ///
    /// The stanza addressed to `fingerprint` is tried first; failing that every
    /// stanza is tried, so an envelope addressed under a stale fingerprint can
    /// still be opened by the right key.
    pub fn open(&self, fingerprint: &str, secret: &StaticSecret) -> Result<Vec<u8>, CryptoError> {
        if self.version != ENVELOPE_VERSION {
            return Err(CryptoError::DecryptionFailed(format!(
                "unsupported envelope version {}",
                self.version
            )));
        }
        if self.recipients.is_empty() {
            return Err(CryptoError::NoRecipients);
        }

        let own_pub = X25519PublicKey::from(secret);
        let addressed = self
            .recipients
            .iter()
            .filter(|s| s.fingerprint.eq_ignore_ascii_case(fingerprint));
        let others = self
            .recipients
            .iter()
            .filter(|s| !s.fingerprint.eq_ignore_ascii_case(fingerprint));

        let content_key = addressed
            .chain(others)
            .find_map(|stanza| unwrap_key(stanza, secret, &own_pub).ok())
            .ok_or_else(|| {
                CryptoError::DecryptionFailed("no recipient stanza opens with this key".to_string())
            })?;

        let nonce = decode_b64(&self.nonce, "nonce")?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::DecryptionFailed("bad nonce length".to_string()));
        }
        let ciphertext = decode_b64(&self.ciphertext, "ciphertext")?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&content_key[..]));
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed("payload authentication failed".to_string()))
    }

    pub fn is_addressed_to(&self, fingerprint: &str) -> bool {
        self.recipients
            .iter()
            .any(|s| s.fingerprint.eq_ignore_ascii_case(fingerprint))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a sealed blob. A blob that is not an envelope cannot be opened,
    /// so it is reported as a decryption failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::DecryptionFailed(format!("not an envelope: {e}")))
    }
}

fn aead_seal(key: &[u8; 32], plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::MalformedPayload("AES-GCM encryption failed".to_string()))?;
    Ok((nonce, ciphertext))
}

fn derive_kek(
    shared: &[u8; 32],
    ephemeral_pub: &X25519PublicKey,
    recipient_pub: &X25519PublicKey,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_pub.as_bytes());
    salt[32..].copy_from_slice(recipient_pub.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut kek = Zeroizing::new([0u8; 32]);
    hk.expand(KDF_INFO, &mut kek[..])
        .map_err(|e| CryptoError::InvalidKey(format!("hkdf: {e}")))?;
    Ok(kek)
}

fn unwrap_key(
    stanza: &RecipientStanza,
    secret: &StaticSecret,
    own_pub: &X25519PublicKey,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let eph_bytes: [u8; 32] = hex::decode(&stanza.ephemeral_key)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed("ephemeral key must be 32 bytes".to_string()))?;
    let ephemeral_pub = X25519PublicKey::from(eph_bytes);

    let shared = secret.diffie_hellman(&ephemeral_pub);
    if !shared.was_contributory() {
        return Err(CryptoError::DecryptionFailed("low-order ephemeral key".to_string()));
    }
    let kek = derive_kek(shared.as_bytes(), &ephemeral_pub, own_pub)?;

    let wrapped = decode_b64(&stanza.wrapped_key, "wrapped key")?;
    if wrapped.len() <= NONCE_LEN {
        return Err(CryptoError::DecryptionFailed("wrapped key too short".to_string()));
    }
    let (nonce, ct) = wrapped.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&kek[..]));
    let plain = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| CryptoError::DecryptionFailed("key unwrap failed".to_string()))?,
    );

    let mut key = Zeroizing::new([0u8; 32]);
    if plain.len() != key.len() {
        return Err(CryptoError::DecryptionFailed("content key must be 32 bytes".to_string()));
    }
    key.copy_from_slice(&plain);
    Ok(key)
}

fn decode_b64(s: &str, what: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64
        .decode(s)
        .map_err(|e| CryptoError::DecryptionFailed(format!("{what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AgentKeys;
    use chrono::Utc;

    fn agent(name: &str) -> (AgentKeys, PublicIdentity) {
        let keys = AgentKeys::generate();
        let id = keys.public_identity(name, Utc::now());
        (keys, id)
    }

    #[test]
    fn test_roundtrip_for_every_recipient() {
        let (a, a_id) = agent("laptop");
        let (b, b_id) = agent("desktop");
        let env = Envelope::seal(b"seed body", &[a_id.clone(), b_id.clone()]).unwrap();

        assert_eq!(env.recipients.len(), 2);
        assert_eq!(env.open(&a_id.fingerprint, a.encryption_secret()).unwrap(), b"seed body");
        assert_eq!(env.open(&b_id.fingerprint, b.encryption_secret()).unwrap(), b"seed body");
    }

    #[test]
    fn test_wrong_key_fails_with_decryption_failed() {
        let (_, a_id) = agent("laptop");
        let (outsider, outsider_id) = agent("outsider");
        let env = Envelope::seal(b"secret", &[a_id]).unwrap();

        let err = env
            .open(&outsider_id.fingerprint, outsider.encryption_secret())
            .unwrap_err();
        assert!(matches!(err, CryptoError::DecryptionFailed(_)));
    }

    #[test]
    fn test_no_recipients() {
        assert!(matches!(Envelope::seal(b"x", &[]), Err(CryptoError::NoRecipients)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (a, a_id) = agent("laptop");
        let mut env = Envelope::seal(b"payload bytes", &[a_id.clone()]).unwrap();
        let mut ct = BASE64.decode(&env.ciphertext).unwrap();
        ct[0] ^= 0x01;
        env.ciphertext = BASE64.encode(ct);

        assert!(matches!(
            env.open(&a_id.fingerprint, a.encryption_secret()),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_opens_under_mismatched_fingerprint() {
        let (a, a_id) = agent("laptop");
        let env = Envelope::seal(b"hello", &[a_id]).unwrap();
        assert_eq!(env.open("0000", a.encryption_secret()).unwrap(), b"hello");
    }

    #[test]
    fn test_garbage_blob_is_decryption_failure() {
        assert!(matches!(
            Envelope::from_bytes(b"not json"),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }
}
