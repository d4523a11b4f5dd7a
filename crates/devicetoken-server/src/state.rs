//! Shared application state

use crate::session::SessionProvider;
use devicetoken_auth::Authenticator;
use devicetoken_core::HeaderNames;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    /// Request authentication (tokens, devices, store)
    pub auth: Arc<Authenticator>,
    /// Session fallback provider
    pub sessions: Arc<dyn SessionProvider>,
}

impl AppState {
    pub fn new(auth: Arc<Authenticator>, sessions: Arc<dyn SessionProvider>) -> Self {
        Self { auth, sessions }
    }

    /// Configured auth header names
    pub fn header_names(&self) -> &HeaderNames {
        &self.auth.config().headers
    }
}
