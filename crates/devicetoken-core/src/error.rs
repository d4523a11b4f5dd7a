//! Error types for devicetoken
//!
//! Two families: [`AuthError`] is a hard failure that must reach the caller,
//! [`Rejection`] is an expected authentication failure that the resolver
//! absorbs into an unauthenticated outcome.

use thiserror::Error;

/// Fatal errors: contract violations and unavailable collaborators
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Token encoding failed: {0}")]
    Codec(String),

    #[error("{0}")]
    Internal(String),
}

/// Result type alias using devicetoken's fatal error
pub type Result<T> = std::result::Result<T, AuthError>;

/// Why a request did not authenticate
///
/// Only used for internal decisions and debug logs. Clients always see the
/// same unauthenticated response regardless of the variant.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("identity token signature is invalid")]
    InvalidSignature,

    #[error("identity token has expired")]
    Expired,

    #[error("no token record for client")]
    UnknownDevice,

    #[error("presented secret does not match")]
    SecretMismatch,

    #[error("account not found")]
    AccountNotFound,

    #[error("account failed validity checks")]
    AccountInvalid,

    #[error("timed out waiting for account lock")]
    LockTimeout,
}

impl Rejection {
    /// Stable machine-readable code for logs
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::InvalidSignature => "invalid_signature",
            Rejection::Expired => "expired",
            Rejection::UnknownDevice => "unknown_device",
            Rejection::SecretMismatch => "secret_mismatch",
            Rejection::AccountNotFound => "account_not_found",
            Rejection::AccountInvalid => "account_invalid",
            Rejection::LockTimeout => "lock_timeout",
        }
    }
}
