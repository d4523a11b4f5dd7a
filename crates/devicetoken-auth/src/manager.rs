//! Device token lifecycle
//!
//! Every change to an account's device map goes through [`AccountTokens`]:
//! 1. `issue` signs a fresh token and replaces the client's record
//! 2. `rotate` does the same but keeps the outgoing digest for the grace window
//! 3. `validate`/`check` compare a presented token against the record
//! 4. `revoke`, `revoke_all` and `revoke_all_except` remove records
//!
//! Issue and rotate also prune expired records and evict the least recently
//! updated devices once the account exceeds `max_devices`.

use crate::codec::IdentityCodec;
use crate::record::{DeviceInfo, DeviceMap, SecretHash, SecretMatch, TokenRecord};
use crate::storage::{StoreError, UserStore};
use chrono::{DateTime, Utc};
use devicetoken_core::{AccountId, AuthConfig, AuthError, ClientId, Clock, Rejection, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// A token as handed to the client. The only place the raw token exists.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub account: AccountId,
    pub client_id: ClientId,
    /// Raw token for the `Authorization` header
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub record: TokenRecord,
}

#[derive(Debug, Clone, Copy)]
enum Mode<'r> {
    Issue,
    Rotate,
    /// Rotate only while the given raw token is still the live secret
    RotateFrom(&'r str),
}

/// Shared token lifecycle service
pub struct TokenManager {
    store: Arc<dyn UserStore>,
    codec: Arc<IdentityCodec>,
    config: Arc<AuthConfig>,
    clock: Arc<dyn Clock>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn UserStore>,
        codec: Arc<IdentityCodec>,
        config: Arc<AuthConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            codec,
            config,
            clock,
        }
    }

    /// Scope token operations to one account
    pub fn account<'a>(&'a self, account: &AccountId) -> AccountTokens<'a> {
        AccountTokens {
            manager: self,
            account: account.clone(),
        }
    }

    pub fn codec(&self) -> &IdentityCodec {
        &self.codec
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

/// Token operations for a single account
pub struct AccountTokens<'a> {
    manager: &'a TokenManager,
    account: AccountId,
}

impl AccountTokens<'_> {
    pub fn account_id(&self) -> &AccountId {
        &self.account
    }

    /// Issue a fresh token for `client_id`, replacing any existing record
    pub async fn issue(&self, client_id: &ClientId) -> Result<IssuedToken> {
        self.write_token(client_id, Mode::Issue)
            .await?
            .ok_or_else(|| AuthError::Internal("device update did not run".into()))
    }

    /// Replace the token for `client_id`, keeping the outgoing one valid for
    /// the grace window. Acts like `issue` when no record exists.
    pub async fn rotate(&self, client_id: &ClientId) -> Result<IssuedToken> {
        self.write_token(client_id, Mode::Rotate)
            .await?
            .ok_or_else(|| AuthError::Internal("device update did not run".into()))
    }

    /// Rotate only if `presented` is still the live secret for `client_id`.
    ///
    /// Returns `None` when another request rotated first or the record is
    /// gone; the check and the rotation happen in one store update.
    pub async fn rotate_from(
        &self,
        client_id: &ClientId,
        presented: &str,
    ) -> Result<Option<IssuedToken>> {
        self.write_token(client_id, Mode::RotateFrom(presented)).await
    }

    async fn write_token(
        &self,
        client_id: &ClientId,
        mode: Mode<'_>,
    ) -> Result<Option<IssuedToken>> {
        let manager = self.manager;
        let signed = manager.codec.encode(&self.account)?;
        let now = manager.clock.now();
        let grace = manager.config.grace_window();
        let max_devices = manager.config.max_devices;
        let hash = SecretHash::of(&signed.token);
        let expires_at = signed.expires_at;

        let mut outcome: Option<(TokenRecord, Vec<ClientId>, usize)> = None;
        manager
            .store
            .update_devices(
                &self.account,
                Box::new(|devices: &mut DeviceMap| {
                    if let Mode::RotateFrom(presented) = mode {
                        let live = devices.get(client_id).is_some_and(|r| {
                            !r.is_expired(now) && r.secret_hash.matches(presented)
                        });
                        if !live {
                            return;
                        }
                    }
                    let pruned = devices.prune(now, grace);
                    let record = match mode {
                        Mode::Issue => {
                            devices.insert_issued(client_id.clone(), hash, now, expires_at)
                        }
                        Mode::Rotate | Mode::RotateFrom(_) => {
                            devices.insert_rotated(client_id.clone(), hash, now, expires_at)
                        }
                    }
                    .clone();
                    let evicted = devices.evict_over(max_devices, client_id);
                    outcome = Some((record, evicted, pruned));
                }),
            )
            .await?;

        let Some((record, evicted, pruned)) = outcome else {
            debug!(
                "Skipped rotation for account {} client {}: secret no longer current",
                self.account, client_id
            );
            return Ok(None);
        };

        if pruned > 0 {
            debug!("Pruned {} expired device(s) from account {}", pruned, self.account);
        }
        for id in &evicted {
            info!("Evicted device {} from account {}", id, self.account);
        }
        match mode {
            Mode::Issue => info!("Issued token for account {} client {}", self.account, client_id),
            Mode::Rotate | Mode::RotateFrom(_) => {
                debug!("Rotated token for account {} client {}", self.account, client_id)
            }
        }

        Ok(Some(IssuedToken {
            account: self.account.clone(),
            client_id: client_id.clone(),
            token: signed.token,
            expires_at: record.expires_at,
            record,
        }))
    }

    /// Check a presented raw token, reporting which secret matched or why it
    /// was rejected. Only store failures are errors.
    pub async fn check(
        &self,
        client_id: &ClientId,
        raw: &str,
    ) -> Result<std::result::Result<SecretMatch, Rejection>> {
        let devices = match self.manager.store.load_devices(&self.account).await {
            Ok(devices) => devices,
            Err(StoreError::NotFound(_)) => return Ok(Err(Rejection::AccountNotFound)),
            Err(e) => return Err(e.into()),
        };
        let now = self.manager.clock.now();
        Ok(devices.check(client_id, raw, now, self.manager.config.grace_window()))
    }

    /// Whether `raw` is currently accepted for `client_id`
    pub async fn validate(&self, client_id: &ClientId, raw: &str) -> Result<bool> {
        Ok(self.check(client_id, raw).await?.is_ok())
    }

    /// Current record for `client_id`, if any
    pub async fn record(&self, client_id: &ClientId) -> Result<Option<TokenRecord>> {
        let devices = self.manager.store.load_devices(&self.account).await?;
        Ok(devices.get(client_id).cloned())
    }

    pub async fn contains(&self, client_id: &ClientId) -> Result<bool> {
        Ok(self.record(client_id).await?.is_some())
    }

    /// Remove the record for one client (sign-out)
    pub async fn revoke(&self, client_id: &ClientId) -> Result<bool> {
        let mut removed = false;
        self.manager
            .store
            .update_devices(
                &self.account,
                Box::new(|devices: &mut DeviceMap| {
                    removed = devices.remove(client_id).is_some();
                }),
            )
            .await?;
        if removed {
            info!("Revoked device {} for account {}", client_id, self.account);
        }
        Ok(removed)
    }

    /// Remove every record for the account
    pub async fn revoke_all(&self) -> Result<usize> {
        self.revoke_all_except(None).await
    }

    /// Remove every record except the one for `keep`
    pub async fn revoke_all_except(&self, keep: Option<&ClientId>) -> Result<usize> {
        let mut removed = 0;
        self.manager
            .store
            .update_devices(
                &self.account,
                Box::new(|devices: &mut DeviceMap| {
                    removed = devices.retain_only(keep);
                }),
            )
            .await?;
        info!("Revoked {} device(s) for account {}", removed, self.account);
        Ok(removed)
    }

    /// React to a password change on `current`: drop the account's other
    /// devices when configured to
    pub async fn password_changed(&self, current: Option<&ClientId>) -> Result<usize> {
        if !self.manager.config.remove_tokens_after_password_change {
            return Ok(0);
        }
        self.revoke_all_except(current).await
    }

    /// List device records, most recently updated first
    pub async fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let devices = self.manager.store.load_devices(&self.account).await?;
        let mut infos: Vec<DeviceInfo> = devices
            .iter()
            .map(|(id, record)| DeviceInfo::from_record(id, record))
            .collect();
        infos.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Account, UserStorage};
    use chrono::Duration;
    use devicetoken_core::ManualClock;

    struct Fixture {
        clock: Arc<ManualClock>,
        storage: Arc<UserStorage>,
        manager: TokenManager,
    }

    async fn fixture(config: AuthConfig) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let storage = Arc::new(UserStorage::in_memory());
        storage.save_account(Account::new("alice")).await.unwrap();
        storage.save_account(Account::new("bob")).await.unwrap();
        let config = Arc::new(config.with_secret("test-secret"));
        let codec = Arc::new(IdentityCodec::new(&config, clock.clone()));
        let manager = TokenManager::new(storage.clone(), codec, config, clock.clone());
        Fixture {
            clock,
            storage,
            manager,
        }
    }

    fn alice() -> AccountId {
        AccountId::from("alice")
    }

    #[tokio::test]
    async fn test_issue_then_validate() {
        let fx = fixture(AuthConfig::new()).await;
        let tokens = fx.manager.account(&alice());
        let web = ClientId::from("web");

        let issued = tokens.issue(&web).await.unwrap();
        assert!(tokens.validate(&web, &issued.token).await.unwrap());
        assert!(!tokens.validate(&web, "bogus").await.unwrap());
        assert!(!tokens.validate(&ClientId::from("other"), &issued.token).await.unwrap());
        assert_eq!(issued.expires_at, issued.record.expires_at);
        assert!(issued.record.last_secret_hash.is_none());
    }

    #[tokio::test]
    async fn test_rotation_grace_window() {
        let fx = fixture(AuthConfig::new().with_grace_window_secs(5)).await;
        let tokens = fx.manager.account(&alice());
        let web = ClientId::from("web");

        let abc = tokens.issue(&web).await.unwrap().token;
        assert!(tokens.validate(&web, &abc).await.unwrap());

        let xyz = tokens.rotate(&web).await.unwrap().token;
        assert_ne!(abc, xyz);
        assert_eq!(tokens.check(&web, &abc).await.unwrap(), Ok(SecretMatch::Previous));
        assert_eq!(tokens.check(&web, &xyz).await.unwrap(), Ok(SecretMatch::Current));

        fx.clock.advance_secs(5);
        assert!(tokens.validate(&web, &abc).await.unwrap());

        fx.clock.advance_secs(1);
        assert_eq!(
            tokens.check(&web, &abc).await.unwrap(),
            Err(Rejection::SecretMismatch)
        );
        assert!(tokens.validate(&web, &xyz).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotate_from_requires_live_secret() {
        let fx = fixture(AuthConfig::new().with_grace_window_secs(5)).await;
        let tokens = fx.manager.account(&alice());
        let web = ClientId::from("web");

        let abc = tokens.issue(&web).await.unwrap().token;
        let xyz = tokens.rotate_from(&web, &abc).await.unwrap().unwrap().token;

        // abc is only the previous secret now
        assert!(tokens.rotate_from(&web, &abc).await.unwrap().is_none());
        assert_eq!(tokens.check(&web, &xyz).await.unwrap(), Ok(SecretMatch::Current));

        assert!(tokens
            .rotate_from(&ClientId::from("phone"), &xyz)
            .await
            .unwrap()
            .is_none());
        assert_eq!(tokens.devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_only_one_prior_secret() {
        let fx = fixture(AuthConfig::new()).await;
        let tokens = fx.manager.account(&alice());
        let web = ClientId::from("web");

        let s1 = tokens.issue(&web).await.unwrap().token;
        let s2 = tokens.rotate(&web).await.unwrap().token;
        let s3 = tokens.rotate(&web).await.unwrap().token;

        assert!(!tokens.validate(&web, &s1).await.unwrap());
        assert!(tokens.validate(&web, &s2).await.unwrap());
        assert!(tokens.validate(&web, &s3).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotation_extends_expiry() {
        let fx = fixture(AuthConfig::new().with_token_lifetime_secs(3600)).await;
        let tokens = fx.manager.account(&alice());
        let web = ClientId::from("web");

        let first = tokens.issue(&web).await.unwrap();
        fx.clock.advance_secs(600);
        let second = tokens.rotate(&web).await.unwrap();
        assert!(second.expires_at > first.expires_at);
        assert_eq!(second.record.issued_at, first.record.issued_at);
    }

    #[tokio::test]
    async fn test_expired_record_fails_closed() {
        let fx = fixture(AuthConfig::new().with_token_lifetime_secs(60)).await;
        let tokens = fx.manager.account(&alice());
        let web = ClientId::from("web");

        let issued = tokens.issue(&web).await.unwrap();
        fx.clock.advance_secs(60);
        assert_eq!(
            tokens.check(&web, &issued.token).await.unwrap(),
            Err(Rejection::Expired)
        );
    }

    #[tokio::test]
    async fn test_eviction_keeps_most_recent() {
        let fx = fixture(AuthConfig::new().with_max_devices(2)).await;
        let tokens = fx.manager.account(&alice());

        let d1 = tokens.issue(&ClientId::from("d1")).await.unwrap();
        fx.clock.advance_secs(1);
        tokens.issue(&ClientId::from("d2")).await.unwrap();
        fx.clock.advance_secs(1);
        tokens.issue(&ClientId::from("d3")).await.unwrap();

        let devices = fx.storage.load_devices(&alice()).await.unwrap();
        assert_eq!(
            devices.client_ids(),
            vec![ClientId::from("d2"), ClientId::from("d3")]
        );
        assert!(!tokens.validate(&ClientId::from("d1"), &d1.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_eviction_follows_updates() {
        let fx = fixture(AuthConfig::new().with_max_devices(2)).await;
        let tokens = fx.manager.account(&alice());

        tokens.issue(&ClientId::from("d1")).await.unwrap();
        fx.clock.advance_secs(1);
        tokens.issue(&ClientId::from("d2")).await.unwrap();
        fx.clock.advance_secs(1);
        // d1 becomes the most recently updated
        tokens.rotate(&ClientId::from("d1")).await.unwrap();
        fx.clock.advance_secs(1);
        tokens.issue(&ClientId::from("d3")).await.unwrap();

        let devices = fx.storage.load_devices(&alice()).await.unwrap();
        assert_eq!(
            devices.client_ids(),
            vec![ClientId::from("d1"), ClientId::from("d3")]
        );
    }

    #[tokio::test]
    async fn test_eviction_never_exceeds_max() {
        let fx = fixture(AuthConfig::new().with_max_devices(3)).await;
        let tokens = fx.manager.account(&alice());
        for n in 0..10 {
            tokens.issue(&ClientId::new(format!("d{}", n))).await.unwrap();
            fx.clock.advance(Duration::milliseconds(10));
            assert!(fx.storage.load_devices(&alice()).await.unwrap().len() <= 3);
        }
        let ids = fx.storage.load_devices(&alice()).await.unwrap().client_ids();
        assert_eq!(
            ids,
            vec![ClientId::from("d7"), ClientId::from("d8"), ClientId::from("d9")]
        );
    }

    #[tokio::test]
    async fn test_revoke_all() {
        let fx = fixture(AuthConfig::new()).await;
        let tokens = fx.manager.account(&alice());
        let mut issued = Vec::new();
        for id in ["web", "phone", "default"] {
            issued.push(tokens.issue(&ClientId::from(id)).await.unwrap());
        }

        assert_eq!(tokens.revoke_all().await.unwrap(), 3);
        for token in &issued {
            assert!(!tokens.validate(&token.client_id, &token.token).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_revoke_single_device() {
        let fx = fixture(AuthConfig::new()).await;
        let tokens = fx.manager.account(&alice());
        let web = tokens.issue(&ClientId::from("web")).await.unwrap();
        let phone = tokens.issue(&ClientId::from("phone")).await.unwrap();

        assert!(tokens.revoke(&web.client_id).await.unwrap());
        assert!(!tokens.revoke(&web.client_id).await.unwrap());
        assert!(!tokens.validate(&web.client_id, &web.token).await.unwrap());
        assert!(tokens.validate(&phone.client_id, &phone.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_password_change_keeps_current_device() {
        let fx = fixture(AuthConfig::new().with_remove_tokens_after_password_change(true)).await;
        let tokens = fx.manager.account(&alice());
        let old = tokens.issue(&ClientId::from("old")).await.unwrap();
        let current = tokens.issue(&ClientId::from("current")).await.unwrap();

        assert_eq!(tokens.password_changed(Some(&current.client_id)).await.unwrap(), 1);
        assert_eq!(tokens.devices().await.unwrap().len(), 1);
        assert!(tokens.validate(&current.client_id, &current.token).await.unwrap());
        assert!(!tokens.validate(&old.client_id, &old.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_password_change_noop_when_disabled() {
        let fx = fixture(AuthConfig::new()).await;
        let tokens = fx.manager.account(&alice());
        tokens.issue(&ClientId::from("a")).await.unwrap();
        tokens.issue(&ClientId::from("b")).await.unwrap();
        assert_eq!(tokens.password_changed(None).await.unwrap(), 0);
        assert_eq!(tokens.devices().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let fx = fixture(AuthConfig::new()).await;
        let web = ClientId::from("web");
        let alice_token = fx.manager.account(&alice()).issue(&web).await.unwrap();
        let bob = fx.manager.account(&AccountId::from("bob"));
        assert!(!bob.validate(&web, &alice_token.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let fx = fixture(AuthConfig::new()).await;
        let ghost = fx.manager.account(&AccountId::from("ghost"));
        assert_eq!(
            ghost.check(&ClientId::default(), "x").await.unwrap(),
            Err(Rejection::AccountNotFound)
        );
        assert!(matches!(
            ghost.issue(&ClientId::default()).await,
            Err(AuthError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_devices_listing_hides_digests() {
        let fx = fixture(AuthConfig::new()).await;
        let tokens = fx.manager.account(&alice());
        tokens.issue(&ClientId::from("web")).await.unwrap();
        fx.clock.advance_secs(1);
        tokens.issue(&ClientId::from("phone")).await.unwrap();

        let devices = tokens.devices().await.unwrap();
        assert_eq!(devices[0].client_id, "phone");
        assert_eq!(devices[1].client_id, "web");
        let json = serde_json::to_string(&devices).unwrap();
        assert!(!json.contains("secret"));
    }
}
