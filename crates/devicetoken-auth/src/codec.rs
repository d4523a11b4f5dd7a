//! Signed identity tokens
//!
//! The raw token handed to clients is an HMAC-signed JWT carrying the account
//! subject, issue/expiry times and a random `jti`. Decoding checks the
//! signature and expiry only; it never looks at stored device records.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use devicetoken_core::{AccountId, AuthConfig, AuthError, Clock, Rejection, SigningAlgorithm};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Claims carried by a signed identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Account subject
    pub sub: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expires at (unix seconds)
    pub exp: i64,
    /// Per-token random nonce; makes every issued token unique
    pub jti: String,
}

impl IdentityClaims {
    pub fn subject(&self) -> AccountId {
        AccountId::new(self.sub.clone())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// A freshly signed token with the expiry it was signed for
#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Encodes and verifies signed identities with the process-wide secret
pub struct IdentityCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    lifetime: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl IdentityCodec {
    pub fn new(config: &AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            algorithm: jwt_algorithm(config.algorithm),
            lifetime: config.token_lifetime(),
            clock,
        }
    }

    /// Sign a new identity for `subject`, valid for the configured lifetime
    /// from now
    pub fn encode(&self, subject: &AccountId) -> Result<SignedToken, AuthError> {
        let now = self.clock.now();
        let expires_at = now + self.lifetime;
        let claims = IdentityClaims {
            sub: subject.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().simple().to_string(),
        };
        let token = jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Codec(e.to_string()))?;
        Ok(SignedToken { token, expires_at })
    }

    /// Verify signature and expiry of a raw token
    pub fn decode(&self, raw: &str) -> Result<IdentityClaims, Rejection> {
        let mut validation = Validation::new(self.algorithm);
        // Expiry is checked below against the injected clock.
        validation.validate_exp = false;
        validation.leeway = 0;

        let data = jsonwebtoken::decode::<IdentityClaims>(raw, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => Rejection::Expired,
                _ => Rejection::InvalidSignature,
            })?;

        if self.clock.now().timestamp() >= data.claims.exp {
            return Err(Rejection::Expired);
        }
        Ok(data.claims)
    }
}

/// Generate a random signing secret suitable for `AuthConfig::secret`
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 48];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

fn jwt_algorithm(algorithm: SigningAlgorithm) -> Algorithm {
    match algorithm {
        SigningAlgorithm::Hs256 => Algorithm::HS256,
        SigningAlgorithm::Hs384 => Algorithm::HS384,
        SigningAlgorithm::Hs512 => Algorithm::HS512,
    }
}
