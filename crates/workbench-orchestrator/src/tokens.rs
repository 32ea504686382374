// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Access token minting for provisioned instances.
//!
//! Every instance carries two bearer tokens issued at creation time: one for
//! the in-instance agent and one for the WebDAV file gateway. The issuer is
//! a trait so tests can substitute deterministic tokens.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// A minted bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    /// Opaque token string handed to the instance.
    #[serde(rename = "accessToken")]
    pub access_token: String,
}

/// Issues system tokens on behalf of a user.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Mint a token for `user_id`, valid for `life_ms` milliseconds when
    /// given, or non-expiring when `None`.
    async fn issue_system_token(&self, user_id: &str, life_ms: Option<i64>)
    -> Result<AccessToken>;
}

/// HMAC-SHA256 token issuer keyed with a shared secret.
pub struct HmacTokenIssuer {
    key: Vec<u8>,
}

impl HmacTokenIssuer {
    /// Create an issuer from the shared signing key.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl TokenIssuer for HmacTokenIssuer {
    async fn issue_system_token(
        &self,
        user_id: &str,
        life_ms: Option<i64>,
    ) -> Result<AccessToken> {
        let expiry = life_ms
            .map(|ms| (chrono::Utc::now().timestamp_millis() + ms).to_string())
            .unwrap_or_else(|| "never".to_string());
        let payload = format!("{user_id}:{expiry}");

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| Error::Upstream(format!("token signing key rejected: {e}")))?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();

        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(signature)
        );
        Ok(AccessToken {
            access_token: token,
        })
    }
}

/// Deterministic issuer for tests.
pub struct MockTokenIssuer;

#[async_trait]
impl TokenIssuer for MockTokenIssuer {
    async fn issue_system_token(
        &self,
        user_id: &str,
        life_ms: Option<i64>,
    ) -> Result<AccessToken> {
        let suffix = life_ms.map_or_else(|| "forever".to_string(), |ms| ms.to_string());
        Ok(AccessToken {
            access_token: format!("token-{user_id}-{suffix}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hmac_tokens_are_signed_and_distinct_per_user() {
        let issuer = HmacTokenIssuer::new(b"unit-test-key".to_vec());
        let a = issuer.issue_system_token("alice", None).await.unwrap();
        let b = issuer.issue_system_token("bob", None).await.unwrap();

        assert_ne!(a.access_token, b.access_token);
        // payload.signature shape
        assert_eq!(a.access_token.matches('.').count(), 1);

        let (payload, _) = a.access_token.split_once('.').unwrap();
        let decoded = URL_SAFE_NO_PAD.decode(payload).unwrap();
        assert_eq!(decoded, b"alice:never");
    }

    #[tokio::test]
    async fn mock_tokens_are_deterministic() {
        let issuer = MockTokenIssuer;
        let t1 = issuer.issue_system_token("carol", Some(1000)).await.unwrap();
        let t2 = issuer.issue_system_token("carol", Some(1000)).await.unwrap();
        assert_eq!(t1.access_token, t2.access_token);
        assert_eq!(t1.access_token, "token-carol-1000");
    }
}
