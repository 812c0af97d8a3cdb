//! Token issuance, verification, authorization and revocation

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AuthError, ErrorKind};
use crate::keystore::KeyStore;
use crate::store::{RevocationRecord, RevocationStore, TokenStore};
use crate::token::{Capability, SignedToken, TokenPayload, TokenType};

#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    pub token_type: TokenType,
    /// Lifetime from issuance; `None` or zero means the token never expires
    pub ttl: Option<Duration>,
    pub not_before: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Result of verifying a token, suitable for display and audit logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenVerdict {
    pub token_id: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Issues and checks capability tokens on behalf of the local identity.
///
/// Token and revocation state are injected so the same authority works over
/// in-memory stores in tests and file-backed stores on disk.
pub struct TokenAuthority {
    keys: Arc<KeyStore>,
    tokens: Arc<dyn TokenStore>,
    revocations: Arc<dyn RevocationStore>,
}

impl TokenAuthority {
    pub fn new(
        keys: Arc<KeyStore>,
        tokens: Arc<dyn TokenStore>,
        revocations: Arc<dyn RevocationStore>,
    ) -> Self {
        Self {
            keys,
            tokens,
            revocations,
        }
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub async fn issue(
        &self,
        subject: &str,
        capabilities: impl IntoIterator<Item = Capability>,
        options: IssueOptions,
    ) -> Result<SignedToken, AuthError> {
        self.issue_at(subject, capabilities, options, Utc::now()).await
    }

    /// Issue with an explicit issuance time
    pub async fn issue_at(
        &self,
        subject: &str,
        capabilities: impl IntoIterator<Item = Capability>,
        options: IssueOptions,
        issued_at: DateTime<Utc>,
    ) -> Result<SignedToken, AuthError> {
        let capabilities: BTreeSet<Capability> = capabilities.into_iter().collect();
        if capabilities.is_empty() {
            return Err(AuthError::InvalidCapabilities);
        }

        let expires_at = match options.ttl.filter(|ttl| *ttl > Duration::zero()) {
            Some(ttl) => Some(issued_at.checked_add_signed(ttl).ok_or_else(|| {
                AuthError::MalformedPayload(format!("ttl of {}s overflows the expiry time", ttl.num_seconds()))
            })?),
            None => None,
        };

        let mut payload = TokenPayload {
            token_id: String::new(),
            token_type: options.token_type,
            issuer: self.keys.fingerprint().to_string(),
            subject: subject.to_string(),
            capabilities,
            issued_at,
            expires_at,
            not_before: options.not_before,
            metadata: options.metadata,
        };
        payload.token_id = payload
            .compute_id()
            .map_err(|e| AuthError::MalformedPayload(e.to_string()))?;

        let message = payload
            .signing_bytes()
            .map_err(|e| AuthError::MalformedPayload(e.to_string()))?;
        let token = SignedToken {
            signature: self.keys.sign(&message),
            payload,
        };

        self.tokens.append(&token).await?;
        info!(
            token_id = %token.token_id(),
            subject = %token.payload.subject,
            capabilities = token.payload.capabilities.len(),
            "Issued token"
        );
        Ok(token)
    }

    pub async fn verify(&self, token: &SignedToken) -> Result<(), AuthError> {
        self.verify_at(token, Utc::now()).await
    }

    /// Check revocation, issuer, content hash, signature and time window, in
    /// that order. Capability membership is not checked here.
    pub async fn verify_at(&self, token: &SignedToken, now: DateTime<Utc>) -> Result<(), AuthError> {
        let payload = &token.payload;
        let token_id = payload.token_id.clone();

        if self.revocations.is_revoked(&token_id).await? {
            return Err(AuthError::Revoked(token_id));
        }

        let issuer = self
            .keys
            .lookup(&payload.issuer)
            .ok_or_else(|| AuthError::UnknownIssuer(payload.issuer.clone()))?;

        let invalid = |detail: String| AuthError::InvalidSignature {
            token_id: token_id.clone(),
            detail,
        };

        if !issuer.matches(&token.signature.signer) {
            return Err(invalid(format!(
                "signed by {} but issued by {}",
                token.signature.signer, payload.issuer
            )));
        }

        let expected_id = payload.compute_id().map_err(|e| invalid(e.to_string()))?;
        if expected_id != payload.token_id {
            return Err(invalid("token id does not match payload".to_string()));
        }

        let key = issuer.verifying_key().map_err(|e| invalid(e.to_string()))?;
        let message = payload.signing_bytes().map_err(|e| invalid(e.to_string()))?;
        token
            .signature
            .verify(&message, &key)
            .map_err(|e| invalid(e.to_string()))?;

        if let Some(not_before) = payload.not_before {
            if now < not_before {
                return Err(AuthError::NotYetValid {
                    token_id,
                    not_before,
                });
            }
        }
        if let Some(expired_at) = payload.expires_at {
            if now >= expired_at {
                return Err(AuthError::Expired {
                    token_id,
                    expired_at,
                });
            }
        }
        Ok(())
    }

    /// Verify and summarize the outcome instead of failing
    pub async fn verdict(&self, token: &SignedToken, now: DateTime<Utc>) -> Result<TokenVerdict, AuthError> {
        let token_id = token.token_id().to_string();
        match self.verify_at(token, now).await {
            Ok(()) => Ok(TokenVerdict {
                token_id,
                valid: true,
                reason: None,
                detail: None,
            }),
            Err(e) => match e.kind() {
                Some(kind) => Ok(TokenVerdict {
                    token_id,
                    valid: false,
                    reason: Some(kind),
                    detail: Some(e.to_string()),
                }),
                None => Err(e),
            },
        }
    }

    /// The production entry point: is `token` good for `capability` at `now`?
    pub async fn authorize(
        &self,
        token: &SignedToken,
        capability: Capability,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        if let Err(e) = self.verify_at(token, now).await {
            debug!(token_id = %token.token_id(), error = %e, "Authorization failed verification");
            return Err(e);
        }
        if !token.payload.grants(capability) {
            debug!(token_id = %token.token_id(), %capability, "Capability not granted");
            return Err(AuthError::CapabilityDenied { capability });
        }
        Ok(())
    }

    /// Revoke a token id. Idempotent; returns `true` when newly revoked.
    pub async fn revoke(&self, token_id: &str, reason: Option<String>) -> Result<bool, AuthError> {
        let newly = self
            .revocations
            .revoke(RevocationRecord {
                token_id: token_id.to_string(),
                revoked_at: Utc::now(),
                reason,
            })
            .await?;
        if newly {
            info!(token_id, "Revoked token");
        } else {
            debug!(token_id, "Token already revoked");
        }
        Ok(newly)
    }

    pub async fn is_revoked(&self, token_id: &str) -> Result<bool, AuthError> {
        Ok(self.revocations.is_revoked(token_id).await?)
    }

    /// Tokens in issuance order
    pub async fn list(&self) -> Result<Vec<SignedToken>, AuthError> {
        Ok(self.tokens.list().await?)
    }

    pub async fn get(&self, token_id: &str) -> Result<SignedToken, AuthError> {
        self.tokens
            .get(token_id)
            .await?
            .ok_or_else(|| AuthError::TokenNotFound(token_id.to_string()))
    }

    /// Resolve a unique id prefix to a full token id
    pub async fn resolve(&self, prefix: &str) -> Result<String, AuthError> {
        let prefix = prefix.to_lowercase();
        let mut matches = self
            .tokens
            .list()
            .await?
            .into_iter()
            .map(|t| t.payload.token_id)
            .filter(|id| id.starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id),
            (None, _) => Err(AuthError::TokenNotFound(prefix)),
            (Some(_), Some(_)) => Err(AuthError::AmbiguousTokenId(prefix)),
        }
    }

    pub async fn export(&self, token_id: &str) -> Result<String, AuthError> {
        self.get(token_id).await?.to_export_json()
    }

    /// Import a token exported elsewhere. The signature must verify against
    /// a known key; expiry and revocation are not checked so that expired
    /// tokens can still be archived for audit.
    pub async fn import(&self, json: &str) -> Result<SignedToken, AuthError> {
        let token = SignedToken::from_export_json(json)?;

        match self.verify_at(&token, token.payload.issued_at).await {
            Ok(())
            | Err(AuthError::Expired { .. })
            | Err(AuthError::NotYetValid { .. })
            | Err(AuthError::Revoked(_)) => {}
            Err(e) => {
                warn!(token_id = %token.token_id(), error = %e, "Rejected token import");
                return Err(e);
            }
        }

        if self.tokens.append(&token).await? {
            info!(token_id = %token.token_id(), issuer = %token.payload.issuer, "Imported token");
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRevocationSet, MemoryTokenStore};

    fn authority() -> TokenAuthority {
        TokenAuthority::new(
            Arc::new(KeyStore::generate("Opus", Utc::now())),
            Arc::new(MemoryTokenStore::new()),
            Arc::new(MemoryRevocationSet::new()),
        )
    }

    #[tokio::test]
    async fn test_issue_and_verify() {
        let auth = authority();
        let token = auth
            .issue("Jarvis", [Capability::MemoryRead], IssueOptions::default())
            .await
            .unwrap();
        assert_eq!(token.payload.issuer, auth.keys().fingerprint());
        assert!(token.payload.expires_at.is_none());
        assert!(auth.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_capabilities_rejected() {
        let auth = authority();
        let err = auth
            .issue("Jarvis", Vec::<Capability>::new(), IssueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCapabilities));
    }

    #[tokio::test]
    async fn test_overflowing_ttl_is_rejected() {
        let auth = authority();
        let options = IssueOptions {
            ttl: Duration::try_days(100_000_000),
            ..Default::default()
        };
        assert!(options.ttl.is_some());
        let err = auth
            .issue("Jarvis", [Capability::MemoryRead], options)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MalformedPayload(_)));
        assert!(auth.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let auth = authority();
        let t0 = Utc::now();
        let token = auth
            .issue_at(
                "Jarvis",
                [Capability::MemoryRead],
                IssueOptions {
                    ttl: Some(Duration::seconds(60)),
                    ..Default::default()
                },
                t0,
            )
            .await
            .unwrap();

        let exp = t0 + Duration::seconds(60);
        assert!(auth.verify_at(&token, exp - Duration::milliseconds(1)).await.is_ok());
        assert!(matches!(
            auth.verify_at(&token, exp).await,
            Err(AuthError::Expired { .. })
        ));
    }

    #[tokio::test]
    async fn test_not_before() {
        let auth = authority();
        let t0 = Utc::now();
        let token = auth
            .issue_at(
                "Jarvis",
                [Capability::AgentStatus],
                IssueOptions {
                    not_before: Some(t0 + Duration::minutes(5)),
                    ..Default::default()
                },
                t0,
            )
            .await
            .unwrap();
        assert!(matches!(
            auth.verify_at(&token, t0).await,
            Err(AuthError::NotYetValid { .. })
        ));
        assert!(auth.verify_at(&token, t0 + Duration::minutes(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_revoke_then_verify() {
        let auth = authority();
        let token = auth
            .issue("Jarvis", [Capability::SyncPush], IssueOptions::default())
            .await
            .unwrap();
        assert!(auth.revoke(token.token_id(), None).await.unwrap());
        assert!(!auth.revoke(token.token_id(), None).await.unwrap());

        let err = auth.verify(&token).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Revoked));
    }

    #[tokio::test]
    async fn test_tampered_subject_is_invalid_signature() {
        let auth = authority();
        let mut token = auth
            .issue("Jarvis", [Capability::MemoryRead], IssueOptions::default())
            .await
            .unwrap();
        token.payload.subject = "Mallory".into();
        let verdict = auth.verdict(&token, Utc::now()).await.unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.reason, Some(ErrorKind::InvalidSignature));
    }

    #[tokio::test]
    async fn test_escalated_capability_is_invalid_signature() {
        let auth = authority();
        let mut token = auth
            .issue("Jarvis", [Capability::MemoryRead], IssueOptions::default())
            .await
            .unwrap();
        token.payload.capabilities.insert(Capability::All);
        // recompute the id so only the signature can catch it
        token.payload.token_id = token.payload.compute_id().unwrap();
        assert!(matches!(
            auth.verify(&token).await,
            Err(AuthError::InvalidSignature { .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_issuer_is_unknown() {
        let auth = authority();
        let stranger = authority();
        let token = stranger
            .issue("Jarvis", [Capability::MemoryRead], IssueOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            auth.verify(&token).await,
            Err(AuthError::UnknownIssuer(_))
        ));
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let issuer = authority();
        let token = issuer
            .issue("Jarvis", [Capability::TrustRead], IssueOptions::default())
            .await
            .unwrap();
        let json = issuer.export(token.token_id()).await.unwrap();

        let mut keys = KeyStore::generate("desktop", Utc::now());
        keys.add_peer(issuer.keys().identity().clone()).unwrap();
        let holder = TokenAuthority::new(
            Arc::new(keys),
            Arc::new(MemoryTokenStore::new()),
            Arc::new(MemoryRevocationSet::new()),
        );
        let imported = holder.import(&json).await.unwrap();
        assert_eq!(imported, token);
        assert_eq!(holder.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_order_and_resolve() {
        let auth = authority();
        let a = auth
            .issue("a", [Capability::MemoryRead], IssueOptions::default())
            .await
            .unwrap();
        let b = auth
            .issue("b", [Capability::MemoryWrite], IssueOptions::default())
            .await
            .unwrap();
        let ids: Vec<_> = auth
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.payload.token_id)
            .collect();
        assert_eq!(ids, vec![a.payload.token_id.clone(), b.payload.token_id.clone()]);

        assert_eq!(auth.resolve(&a.token_id()[..12]).await.unwrap(), a.payload.token_id);
        assert!(matches!(
            auth.resolve("").await,
            Err(AuthError::AmbiguousTokenId(_))
        ));
    }
}
