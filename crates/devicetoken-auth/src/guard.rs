//! Account-scoped exclusive locking
//!
//! Used on the session-authenticated path, where two requests for the same
//! account may both try to bootstrap a token. Token-authenticated rotation
//! does not lock; it relies on the grace window instead.

use crate::storage::UserStore;
use devicetoken_core::{AccountId, Rejection, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ConcurrencyGuard {
    store: Arc<dyn UserStore>,
    timeout: Option<Duration>,
}

impl ConcurrencyGuard {
    pub fn new(store: Arc<dyn UserStore>, timeout: Option<Duration>) -> Self {
        Self { store, timeout }
    }

    /// Run `f` while holding the account's exclusive lock.
    ///
    /// The lock is released on every exit path, including when `f` fails.
    /// The outer `Result` carries fatal errors; the inner one reports a lock
    /// timeout, in which case `f` never ran.
    pub async fn with_account_lock<T, F, Fut>(
        &self,
        account: &AccountId,
        f: F,
    ) -> Result<std::result::Result<T, Rejection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let acquire = self.store.lock_account(account);
        let lock = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(lock) => lock?,
                Err(_) => {
                    warn!("Timed out after {:?} waiting for account {} lock", limit, account);
                    return Ok(Err(Rejection::LockTimeout));
                }
            },
            None => acquire.await?,
        };

        let result = f().await;
        drop(lock);
        debug!("Released lock for account {}", account);
        result.map(Ok)
    }
}
