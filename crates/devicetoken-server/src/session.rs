//! Session fallback identities
//!
//! The session mechanism itself lives outside the token layer. The server only
//! asks a [`SessionProvider`] which account, if any, a request's session
//! belongs to.

use axum::http::{header, HeaderMap};
use devicetoken_core::AccountId;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Name of the cookie carrying the session id
pub const SESSION_COOKIE: &str = "session";

/// Resolves the session-authenticated account of a request
pub trait SessionProvider: Send + Sync {
    fn session_account(&self, headers: &HeaderMap) -> Option<AccountId>;

    /// End the request's session, if any
    fn end_session(&self, headers: &HeaderMap);
}

/// Sessions that never authenticate anyone
pub struct NoSessions;

impl SessionProvider for NoSessions {
    fn session_account(&self, _headers: &HeaderMap) -> Option<AccountId> {
        None
    }

    fn end_session(&self, _headers: &HeaderMap) {}
}

/// In-memory sessions keyed by the `session` cookie
#[derive(Default)]
pub struct CookieSessions {
    sessions: RwLock<HashMap<String, AccountId>>,
}

impl CookieSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `account` and return its id
    pub fn open(&self, account: AccountId) -> String {
        let id = Uuid::new_v4().simple().to_string();
        debug!("Opened session for account {}", account);
        self.sessions.write().insert(id.clone(), account);
        id
    }

    pub fn close(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<AccountId> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionProvider for CookieSessions {
    fn session_account(&self, headers: &HeaderMap) -> Option<AccountId> {
        session_id(headers).and_then(|id| self.get(&id))
    }

    fn end_session(&self, headers: &HeaderMap) {
        if let Some(id) = session_id(headers) {
            self.close(&id);
        }
    }
}

/// Value of the session cookie, if present
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
