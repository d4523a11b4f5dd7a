//! Configuration types for devicetoken

use crate::error::{AuthError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Longest accepted token lifetime or grace window (100 years)
const MAX_DURATION_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// HMAC algorithm used to sign identity tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SigningAlgorithm {
    #[default]
    Hs256,
    Hs384,
    Hs512,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::Hs256 => "HS256",
            SigningAlgorithm::Hs384 => "HS384",
            SigningAlgorithm::Hs512 => "HS512",
        }
    }
}

impl std::str::FromStr for SigningAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HS256" => Ok(SigningAlgorithm::Hs256),
            "HS384" => Ok(SigningAlgorithm::Hs384),
            "HS512" => Ok(SigningAlgorithm::Hs512),
            _ => Err(format!("Invalid algorithm: {}. Use: HS256, HS384, HS512", s)),
        }
    }
}

/// Header names used on requests and responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderNames {
    /// Carries `Bearer <token>` in both directions
    pub access_token: String,
    pub client: String,
    pub expiry: String,
    pub token_type: String,
    pub uid: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            access_token: "authorization".to_string(),
            client: "client".to_string(),
            expiry: "expiry".to_string(),
            token_type: "token-type".to_string(),
            uid: "uid".to_string(),
        }
    }
}

impl HeaderNames {
    fn all(&self) -> [&str; 5] {
        [
            &self.access_token,
            &self.client,
            &self.expiry,
            &self.token_type,
            &self.uid,
        ]
    }
}

/// Authentication configuration, built once at startup and shared read-only
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// How long an issued token (and its device record) stays valid
    pub token_lifetime_secs: i64,
    /// How long the previous secret keeps working after a rotation
    pub grace_window_secs: i64,
    /// Device records kept per account before least-recently-updated eviction
    pub max_devices: usize,
    /// Rotate the token on every successful token-authenticated request
    pub change_headers_on_each_request: bool,
    /// Drop every other device record when the account's password changes
    pub remove_tokens_after_password_change: bool,
    /// Accept an identity resolved by the session layer when no token exists
    pub session_fallback: bool,
    /// Signature algorithm for identity tokens
    pub algorithm: SigningAlgorithm,
    /// Process-wide signing secret
    #[serde(skip_serializing)]
    pub secret: String,
    /// Give up waiting for an account lock after this many milliseconds
    pub lock_timeout_ms: Option<u64>,
    pub headers: HeaderNames,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_lifetime_secs: 14 * 24 * 3600,
            grace_window_secs: 5,
            max_devices: 10,
            change_headers_on_each_request: true,
            remove_tokens_after_password_change: false,
            session_fallback: true,
            algorithm: SigningAlgorithm::Hs256,
            secret: String::new(),
            lock_timeout_ms: None,
            headers: HeaderNames::default(),
        }
    }
}

impl AuthConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON, filling unspecified fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| AuthError::Config(e.to_string()))
    }

    /// Builder pattern: set signing secret
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Builder pattern: set signing algorithm
    pub fn with_algorithm(mut self, algorithm: SigningAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Builder pattern: set token lifetime
    pub fn with_token_lifetime_secs(mut self, secs: i64) -> Self {
        self.token_lifetime_secs = secs;
        self
    }

    /// Builder pattern: set grace window
    pub fn with_grace_window_secs(mut self, secs: i64) -> Self {
        self.grace_window_secs = secs;
        self
    }

    /// Builder pattern: set maximum devices per account
    pub fn with_max_devices(mut self, max: usize) -> Self {
        self.max_devices = max;
        self
    }

    /// Builder pattern: set rotation on every request
    pub fn with_change_headers_on_each_request(mut self, enabled: bool) -> Self {
        self.change_headers_on_each_request = enabled;
        self
    }

    /// Builder pattern: set password-change revocation
    pub fn with_remove_tokens_after_password_change(mut self, enabled: bool) -> Self {
        self.remove_tokens_after_password_change = enabled;
        self
    }

    /// Builder pattern: set session fallback
    pub fn with_session_fallback(mut self, enabled: bool) -> Self {
        self.session_fallback = enabled;
        self
    }

    /// Builder pattern: set account lock timeout
    pub fn with_lock_timeout_ms(mut self, ms: Option<u64>) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    /// Builder pattern: set header names
    pub fn with_headers(mut self, headers: HeaderNames) -> Self {
        self.headers = headers;
        self
    }

    pub fn token_lifetime(&self) -> Duration {
        Duration::seconds(self.token_lifetime_secs)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::seconds(self.grace_window_secs)
    }

    pub fn lock_timeout(&self) -> Option<std::time::Duration> {
        self.lock_timeout_ms.map(std::time::Duration::from_millis)
    }

    /// Check the configuration before it is handed to any component
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            return Err(AuthError::Config("signing secret is empty".into()));
        }
        if self.token_lifetime_secs <= 0 {
            return Err(AuthError::Config(
                "token_lifetime_secs must be positive".into(),
            ));
        }
        if self.grace_window_secs < 0 {
            return Err(AuthError::Config(
                "grace_window_secs must not be negative".into(),
            ));
        }
        if self.token_lifetime_secs > MAX_DURATION_SECS {
            return Err(AuthError::Config("token_lifetime_secs is too large".into()));
        }
        if self.grace_window_secs > MAX_DURATION_SECS {
            return Err(AuthError::Config("grace_window_secs is too large".into()));
        }
        if self.max_devices == 0 {
            return Err(AuthError::Config("max_devices must be at least 1".into()));
        }
        if self.headers.all().iter().any(|h| h.trim().is_empty()) {
            return Err(AuthError::Config("header names must not be empty".into()));
        }
        Ok(())
    }
}
