//! Detached Ed25519 signatures

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// A detached signature block carried next to the payload it signs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetachedSignature {
    /// Fingerprint of the signing key
    pub signer: String,
    pub signed_at: DateTime<Utc>,
    pub signature_hex: String,
}

impl DetachedSignature {
    pub fn create(signer: impl Into<String>, message: &[u8], signing_key: &SigningKey) -> Self {
        let signature = signing_key.sign(message);

        Self {
            signer: signer.into(),
            signed_at: Utc::now(),
            signature_hex: hex::encode(signature.to_bytes()),
        }
    }

    /// Verify against a holder's public key.
    ///
    /// Any malformation of the signature block itself is reported as an
    /// invalid signature: it cannot be told apart from tampering.
    pub fn verify(&self, message: &[u8], verifying_key: &VerifyingKey) -> Result<(), CryptoError> {
        let sig_bytes = hex::decode(&self.signature_hex)
            .map_err(|e| CryptoError::InvalidSignature(format!("signature is not hex: {e}")))?;

        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature("signature must be 64 bytes".to_string()))?;

        let signature = ed25519_dalek::Signature::from_bytes(&sig_array);

        verifying_key
            .verify_strict(message, &signature)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }
}
