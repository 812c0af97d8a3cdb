//! Token authorization scenarios across the authority, stores and key store

use std::sync::Arc;

use chrono::{Duration, Utc};
use keel_core::{
    AuthError, Capability, ErrorKind, IssueOptions, KeyStore, MemoryRevocationSet,
    MemoryTokenStore, SignedToken, TokenAuthority,
};
use proptest::prelude::*;

fn authority() -> TokenAuthority {
    TokenAuthority::new(
        Arc::new(KeyStore::generate("Opus", Utc::now())),
        Arc::new(MemoryTokenStore::new()),
        Arc::new(MemoryRevocationSet::new()),
    )
}

/// A one-hour memory:read grant to Jarvis is good for reading inside the
/// hour, never good for pushing, and dead after it.
#[tokio::test]
async fn test_jarvis_memory_read_grant() {
    let auth = authority();
    let t0 = Utc::now();
    let token = auth
        .issue_at(
            "Jarvis",
            [Capability::MemoryRead],
            IssueOptions {
                ttl: Some(Duration::hours(1)),
                ..Default::default()
            },
            t0,
        )
        .await
        .unwrap();

    let half_hour = t0 + Duration::minutes(30);
    assert!(auth
        .authorize(&token, Capability::MemoryRead, half_hour)
        .await
        .is_ok());

    let denied = auth
        .authorize(&token, Capability::SyncPush, half_hour)
        .await
        .unwrap_err();
    assert!(matches!(
        denied,
        AuthError::CapabilityDenied {
            capability: Capability::SyncPush
        }
    ));

    let expired = auth
        .authorize(&token, Capability::MemoryRead, t0 + Duration::hours(2))
        .await
        .unwrap_err();
    assert_eq!(expired.kind(), Some(ErrorKind::Expired));
}

#[tokio::test]
async fn test_revoked_token_stays_revoked_after_export_roundtrip() {
    let auth = authority();
    let token = auth
        .issue("Jarvis", [Capability::All], IssueOptions::default())
        .await
        .unwrap();
    auth.revoke(token.token_id(), Some("compromised".into()))
        .await
        .unwrap();

    let json = auth.export(token.token_id()).await.unwrap();
    let reparsed = SignedToken::from_export_json(&json).unwrap();
    let err = auth
        .authorize(&reparsed, Capability::MemoryRead, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Revoked(_)));
}

#[tokio::test]
async fn test_revocation_checked_before_signature() {
    let auth = authority();
    let mut token = auth
        .issue("Jarvis", [Capability::MemoryRead], IssueOptions::default())
        .await
        .unwrap();
    auth.revoke(token.token_id(), None).await.unwrap();
    token.signature.signature_hex = "00".repeat(64);
    assert!(matches!(auth.verify(&token).await, Err(AuthError::Revoked(_))));
}

#[tokio::test]
async fn test_rotated_issuer_tokens_still_verify() {
    let mut keys = KeyStore::generate("Opus", Utc::now());
    let tokens = Arc::new(MemoryTokenStore::new());
    let revocations = Arc::new(MemoryRevocationSet::new());

    let before = {
        let auth = TokenAuthority::new(
            Arc::new(KeyStore::new(
                keel_core::AgentKeys::from_material(&keys.keys().to_material()).unwrap(),
                keys.identity().clone(),
            )
            .unwrap()),
            tokens.clone(),
            revocations.clone(),
        );
        auth.issue("Jarvis", [Capability::TrustRead], IssueOptions::default())
            .await
            .unwrap()
    };

    keys.rotate(Utc::now()).unwrap();
    let auth = TokenAuthority::new(Arc::new(keys), tokens, revocations);
    assert!(auth.verify(&before).await.is_ok());
}

fn flip_bit(json: &str, bit: usize) -> Vec<u8> {
    let mut bytes = json.as_bytes().to_vec();
    let idx = bit % (bytes.len() * 8);
    bytes[idx / 8] ^= 1 << (idx % 8);
    bytes
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Flipping any single bit of an exported token never yields a token
    /// that authorizes: it is either unparseable or fails verification.
    #[test]
    fn single_bit_flip_never_authorizes(bit in any::<usize>()) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let auth = authority();
            let token = auth
                .issue("Jarvis", [Capability::MemoryRead], IssueOptions::default())
                .await
                .unwrap();
            let json = token.to_export_json().unwrap();
            let flipped = flip_bit(&json, bit);

            let Ok(text) = String::from_utf8(flipped) else {
                return Ok(());
            };
            let Ok(parsed) = SignedToken::from_export_json(&text) else {
                return Ok(());
            };
            let same_signature = hex::decode(&parsed.signature.signature_hex).ok()
                == hex::decode(&token.signature.signature_hex).ok();
            if parsed.payload == token.payload && same_signature {
                // flip landed outside the signed bytes (whitespace, signed_at, hex case)
                return Ok(());
            }
            let result = auth.verify(&parsed).await;
            prop_assert!(result.is_err(), "tampered token verified: {text}");
            let kind = result.unwrap_err().kind();
            prop_assert!(matches!(
                kind,
                Some(ErrorKind::InvalidSignature) | Some(ErrorKind::UnknownIssuer)
            ));
            Ok::<(), TestCaseError>(())
        })?;
    }
}
