//! devicetoken Auth - Per-device rotating tokens on top of signed identities
//!
//! A raw token is a signed JWT naming the account. The server additionally
//! keeps one record per (account, client) holding only a digest of the
//! current token, so a token is accepted only while its signature, its
//! expiry and the stored digest all agree.
//!
//! # Request Flow
//!
//! 1. The middleware builds [`Credentials`] from the request headers
//! 2. [`Authenticator::resolve`] decides the identity (token or session)
//! 3. The handler runs against the resolved identity
//! 4. [`Authenticator::finish`] rotates the token and returns the headers
//!    the client must use next
//!
//! # Example
//!
//! ```no_run
//! use devicetoken_auth::{Account, Authenticator, Credentials, UserStorage};
//! use devicetoken_core::{AuthConfig, SystemClock};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let storage = Arc::new(UserStorage::in_memory());
//!     storage.save_account(Account::new("alice")).await.unwrap();
//!
//!     let config = Arc::new(AuthConfig::new().with_secret("change-me"));
//!     let auth = Authenticator::new(config, storage, Arc::new(SystemClock)).unwrap();
//!
//!     let login = auth.tokens().account(&"alice".into()).issue(&"web".into()).await.unwrap();
//!     let creds = Credentials::from_parts(Some(&login.token), Some("web"));
//!     let resolution = auth.resolve(&creds, None).await.unwrap();
//!     if let Some(headers) = auth.finish(&resolution, false).await.unwrap() {
//!         println!("next token: {}", headers.access_token);
//!     }
//! }
//! ```

pub mod codec;
pub mod guard;
pub mod manager;
pub mod record;
pub mod resolver;
pub mod storage;

pub use codec::{generate_secret, IdentityClaims, IdentityCodec, SignedToken};
pub use guard::ConcurrencyGuard;
pub use manager::{AccountTokens, IssuedToken, TokenManager};
pub use record::{DeviceInfo, DeviceMap, SecretHash, SecretMatch, TokenRecord};
pub use resolver::{
    AuthHeaders, Authenticator, Credentials, Resolution, SessionResolution, TokenResolution,
    TOKEN_TYPE,
};
pub use storage::{
    Account, AccountLock, DeviceUpdate, StoreError, StoreResult, UserStorage, UserStore,
};
