//! Per-request authentication
//!
//! [`Authenticator::resolve`] runs before the handler and decides who the
//! request belongs to; [`Authenticator::finish`] runs after it and decides
//! which auth headers, if any, go back to the client.
//!
//! Expected failures (bad signature, expiry, unknown device, mismatch, ...)
//! never escape: they collapse into [`Resolution::None`]. Only store and
//! configuration failures are returned as errors.

use crate::codec::IdentityCodec;
use crate::guard::ConcurrencyGuard;
use crate::manager::{IssuedToken, TokenManager};
use crate::record::SecretMatch;
use crate::storage::{Account, StoreError, UserStore};
use chrono::{DateTime, Utc};
use devicetoken_core::{AccountId, AuthConfig, ClientId, Clock, HeaderNames, Rejection, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scheme prefix accepted (and emitted) on the access token header
pub const TOKEN_TYPE: &str = "Bearer";

/// Credentials presented by a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub client_id: ClientId,
}

impl Credentials {
    /// Build credentials from raw header or query values
    pub fn from_parts(access_token: Option<&str>, client: Option<&str>) -> Self {
        Self {
            token: access_token.and_then(strip_scheme),
            client_id: ClientId::or_default(client),
        }
    }

    pub fn anonymous() -> Self {
        Self::from_parts(None, None)
    }
}

fn strip_scheme(raw: &str) -> Option<String> {
    let raw = raw.trim();
    // A bare scheme carries no token
    if raw.eq_ignore_ascii_case(TOKEN_TYPE) {
        return None;
    }
    let token = match raw.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case(TOKEN_TYPE) => rest.trim(),
        _ => raw,
    };
    (!token.is_empty()).then(|| token.to_string())
}

/// Identity established from a valid token
#[derive(Debug, Clone)]
pub struct TokenResolution {
    pub account: Account,
    pub client_id: ClientId,
    /// The raw token that authenticated the request
    pub token: String,
    pub matched: SecretMatch,
}

/// Identity adopted from the session layer
#[derive(Debug, Clone)]
pub struct SessionResolution {
    pub account: Account,
    pub client_id: ClientId,
    /// Whether a token record was bootstrapped during `resolve`
    pub bootstrapped: bool,
}

/// Outcome of request authentication
#[derive(Debug, Clone)]
pub enum Resolution {
    Token(TokenResolution),
    Session(SessionResolution),
    None,
}

impl Resolution {
    pub fn account(&self) -> Option<&Account> {
        match self {
            Resolution::Token(r) => Some(&r.account),
            Resolution::Session(r) => Some(&r.account),
            Resolution::None => None,
        }
    }

    /// Effective client id; cleared for unauthenticated requests
    pub fn client_id(&self) -> Option<&ClientId> {
        match self {
            Resolution::Token(r) => Some(&r.client_id),
            Resolution::Session(r) => Some(&r.client_id),
            Resolution::None => None,
        }
    }

    pub fn used_token_auth(&self) -> bool {
        matches!(self, Resolution::Token(_))
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Resolution::None)
    }
}

/// Auth headers sent back on a successful response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeaders {
    pub access_token: String,
    pub token_type: String,
    pub client: String,
    /// Unix seconds
    pub expiry: i64,
    pub uid: String,
}

impl AuthHeaders {
    pub fn new(
        token: String,
        client_id: &ClientId,
        expires_at: DateTime<Utc>,
        account: &AccountId,
    ) -> Self {
        Self {
            access_token: token,
            token_type: TOKEN_TYPE.to_string(),
            client: client_id.to_string(),
            expiry: expires_at.timestamp(),
            uid: account.to_string(),
        }
    }

    pub fn from_issued(issued: &IssuedToken) -> Self {
        Self::new(
            issued.token.clone(),
            &issued.client_id,
            issued.expires_at,
            &issued.account,
        )
    }

    /// Render as `(name, value)` pairs using the configured header names
    pub fn to_pairs(&self, names: &HeaderNames) -> Vec<(String, String)> {
        vec![
            (
                names.access_token.clone(),
                format!("{} {}", self.token_type, self.access_token),
            ),
            (names.token_type.clone(), self.token_type.clone()),
            (names.client.clone(), self.client.clone()),
            (names.expiry.clone(), self.expiry.to_string()),
            (names.uid.clone(), self.uid.clone()),
        ]
    }
}

/// Request-time authentication service
pub struct Authenticator {
    config: Arc<AuthConfig>,
    store: Arc<dyn UserStore>,
    codec: Arc<IdentityCodec>,
    tokens: Arc<TokenManager>,
    guard: ConcurrencyGuard,
}

impl Authenticator {
    /// Wire up codec, token manager and lock guard. Fails on invalid config.
    pub fn new(
        config: Arc<AuthConfig>,
        store: Arc<dyn UserStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let codec = Arc::new(IdentityCodec::new(&config, clock.clone()));
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            codec.clone(),
            config.clone(),
            clock,
        ));
        let guard = ConcurrencyGuard::new(store.clone(), config.lock_timeout());
        Ok(Self {
            config,
            store,
            codec,
            tokens,
            guard,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    /// Decide who a request belongs to.
    ///
    /// `session` is the identity already established by the session layer,
    /// if any. It wins when it has no token record for the requested client;
    /// otherwise the presented token decides.
    pub async fn resolve(
        &self,
        credentials: &Credentials,
        session: Option<&AccountId>,
    ) -> Result<Resolution> {
        let client_id = &credentials.client_id;

        if let Some(session_id) = session.filter(|_| self.config.session_fallback) {
            if let Some(resolution) = self.resolve_session(session_id, client_id).await? {
                return Ok(resolution);
            }
        }

        let Some(token) = credentials.token.as_deref() else {
            return Ok(Resolution::None);
        };

        match self.resolve_token(token, client_id).await? {
            Ok(resolution) => {
                debug!(
                    "Token authenticated account {} client {}",
                    resolution.account.id, resolution.client_id
                );
                Ok(Resolution::Token(resolution))
            }
            Err(rejection) => {
                debug!(reason = rejection.code(), "Token authentication rejected");
                Ok(Resolution::None)
            }
        }
    }

    async fn resolve_session(
        &self,
        session_id: &AccountId,
        client_id: &ClientId,
    ) -> Result<Option<Resolution>> {
        let account = match self.store.find_account(session_id).await {
            Ok(account) => account,
            Err(StoreError::NotFound(_)) => {
                warn!("Session identity {} has no account, ignoring", session_id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let tokens = self.tokens.account(&account.id);
        if tokens.contains(client_id).await? {
            return Ok(None);
        }

        // First token for a session-authenticated client
        let bootstrap = self
            .guard
            .with_account_lock(&account.id, move || async move {
                if tokens.contains(client_id).await? {
                    return Ok(false);
                }
                tokens.issue(client_id).await?;
                Ok(true)
            })
            .await?;

        let bootstrapped = match bootstrap {
            Ok(issued) => issued,
            Err(rejection) => {
                debug!(reason = rejection.code(), "Session token bootstrap skipped");
                false
            }
        };

        info!("Session authenticated account {} client {}", account.id, client_id);
        Ok(Some(Resolution::Session(SessionResolution {
            account,
            client_id: client_id.clone(),
            bootstrapped,
        })))
    }

    async fn resolve_token(
        &self,
        token: &str,
        client_id: &ClientId,
    ) -> Result<std::result::Result<TokenResolution, Rejection>> {
        let claims = match self.codec.decode(token) {
            Ok(claims) => claims,
            Err(rejection) => return Ok(Err(rejection)),
        };

        let account = match self.store.find_account(&claims.subject()).await {
            Ok(account) => account,
            Err(StoreError::NotFound(_)) => return Ok(Err(Rejection::AccountNotFound)),
            Err(e) => return Err(e.into()),
        };

        let matched = match self.tokens.account(&account.id).check(client_id, token).await? {
            Ok(matched) => matched,
            Err(rejection) => return Ok(Err(rejection)),
        };

        Ok(Ok(TokenResolution {
            account,
            client_id: client_id.clone(),
            token: token.to_string(),
            matched,
        }))
    }

    /// Response-phase step: decide the auth headers for a resolved request.
    ///
    /// `force_rotation` rotates even when per-request rotation is disabled
    /// (explicit refresh).
    pub async fn finish(
        &self,
        resolution: &Resolution,
        force_rotation: bool,
    ) -> Result<Option<AuthHeaders>> {
        let outcome = match resolution {
            Resolution::None => return Ok(None),
            Resolution::Token(r) => self.finish_token(r, force_rotation).await?,
            Resolution::Session(r) => self.finish_session(r).await?,
        };
        match outcome {
            Ok(headers) => Ok(headers),
            Err(rejection) => {
                debug!(reason = rejection.code(), "No auth headers emitted");
                Ok(None)
            }
        }
    }

    async fn ensure_valid(
        &self,
        id: &AccountId,
    ) -> Result<std::result::Result<Account, Rejection>> {
        let account = match self.store.find_account(id).await {
            Ok(account) => account,
            Err(StoreError::NotFound(_)) => return Ok(Err(Rejection::AccountNotFound)),
            Err(e) => return Err(e.into()),
        };
        if !self.store.is_domain_valid(&account).await {
            return Ok(Err(Rejection::AccountInvalid));
        }
        Ok(Ok(account))
    }

    async fn finish_token(
        &self,
        r: &TokenResolution,
        force_rotation: bool,
    ) -> Result<std::result::Result<Option<AuthHeaders>, Rejection>> {
        if let Err(rejection) = self.ensure_valid(&r.account.id).await? {
            return Ok(Err(rejection));
        }

        let tokens = self.tokens.account(&r.account.id);
        // Signed out by a concurrent request
        let Some(record) = tokens.record(&r.client_id).await? else {
            return Ok(Err(Rejection::UnknownDevice));
        };

        // A request that raced a rotation keeps the newer token canonical
        if r.matched == SecretMatch::Previous || !record.secret_hash.matches(&r.token) {
            return Ok(Ok(None));
        }

        if force_rotation || self.config.change_headers_on_each_request {
            // Re-checked inside the store update; None means another request won
            return Ok(Ok(tokens
                .rotate_from(&r.client_id, &r.token)
                .await?
                .map(|issued| AuthHeaders::from_issued(&issued))));
        }

        Ok(Ok(Some(AuthHeaders::new(
            r.token.clone(),
            &r.client_id,
            record.expires_at,
            &r.account.id,
        ))))
    }

    async fn finish_session(
        &self,
        r: &SessionResolution,
    ) -> Result<std::result::Result<Option<AuthHeaders>, Rejection>> {
        if let Err(rejection) = self.ensure_valid(&r.account.id).await? {
            return Ok(Err(rejection));
        }

        let tokens = self.tokens.account(&r.account.id);
        let client_id = &r.client_id;
        let expect_record = r.bootstrapped;
        let locked = self
            .guard
            .with_account_lock(&r.account.id, move || async move {
                if expect_record && !tokens.contains(client_id).await? {
                    return Ok(Err(Rejection::UnknownDevice));
                }
                let issued = tokens.issue(client_id).await?;
                Ok(Ok(Some(AuthHeaders::from_issued(&issued))))
            })
            .await?;

        Ok(locked.and_then(|outcome| outcome))
    }
}
