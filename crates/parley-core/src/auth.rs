//! Credential verification.
//!
//! Credentials are issued by the account service. The messaging core only
//! verifies them and extracts the identity they carry.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parley_protocol::UserId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChatError, ChatResult};

/// A verified caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The authenticated user.
    pub user_id: UserId,
    /// Email claim, if the credential carries one.
    pub email: Option<String>,
}

impl Identity {
    /// Create an identity without an email claim.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
        }
    }
}

/// Turns a bearer credential into a verified identity.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Verify `token`.
    ///
    /// # Errors
    ///
    /// [`ChatError::Authentication`] if the token is missing, malformed,
    /// badly signed or expired.
    async fn validate(&self, token: &str) -> ChatResult<Identity>;
}

/// Claims carried by account-service tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

/// HS256 JWT verification against a shared secret.
pub struct JwtValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a validator for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Sign a token for `identity` valid for `ttl`.
    ///
    /// Token issuance belongs to the account service; this exists for
    /// tooling and tests that need a credential the server will accept.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> ChatResult<String> {
        let now = Utc::now();
        let claims = Claims {
            user_id: identity.user_id.to_string(),
            email: identity.email.clone(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| ChatError::Authentication(format!("cannot sign token: {}", e)))
    }

    fn verify(&self, token: &str) -> ChatResult<Identity> {
        if token.trim().is_empty() {
            return Err(ChatError::Authentication("missing credential".into()));
        }

        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!(error = %e, "Token rejected");
            ChatError::Authentication("invalid or expired token".into())
        })?;

        let user_id = UserId::new(data.claims.user_id);
        if user_id.is_blank() {
            return Err(ChatError::Authentication("token has no user id".into()));
        }

        Ok(Identity {
            user_id,
            email: data.claims.email,
        })
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, token: &str) -> ChatResult<Identity> {
        self.verify(token)
    }
}

/// Extract the credential from an `Authorization: Bearer <token>` value.
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
