//! Account persistence and the `UserStore` collaborator contract
//!
//! [`UserStorage`] is the reference store: accounts and their device maps in
//! memory, optionally persisted as JSON (default
//! `~/.config/devicetoken/accounts.json`).

use crate::record::DeviceMap;
use async_trait::async_trait;
use devicetoken_core::{AccountId, AuthError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Account not found: {0}")]
    NotFound(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Configuration directory not found")]
    NoConfigDir,
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::Store(err.to_string())
    }
}

/// An account as seen by the authentication core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Disabled accounts fail domain validity and never receive auth headers
    #[serde(default)]
    pub disabled: bool,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: AccountId::new(id),
            name: String::new(),
            disabled: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Exclusive per-account lock; released when dropped
pub struct AccountLock {
    _guard: OwnedMutexGuard<()>,
}

impl AccountLock {
    pub fn new(guard: OwnedMutexGuard<()>) -> Self {
        Self { _guard: guard }
    }
}

/// In-place mutation of one account's device map
pub type DeviceUpdate<'a> = Box<dyn FnOnce(&mut DeviceMap) + Send + 'a>;

/// What the authentication core needs from account persistence
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Look up an account by subject id
    async fn find_account(&self, id: &AccountId) -> StoreResult<Account>;

    /// Atomic read of an account's device map
    async fn load_devices(&self, id: &AccountId) -> StoreResult<DeviceMap>;

    /// Atomic read-modify-write of an account's device map
    async fn update_devices(&self, id: &AccountId, update: DeviceUpdate<'_>) -> StoreResult<()>;

    /// Acquire the account's exclusive lock
    async fn lock_account(&self, id: &AccountId) -> StoreResult<AccountLock>;

    /// Whether the account still passes its own integrity checks
    async fn is_domain_valid(&self, account: &Account) -> bool;
}

/// Stored data for one account
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAccount {
    account: Account,
    #[serde(default)]
    devices: DeviceMap,
}

/// Stored data structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredData {
    /// Accounts indexed by id
    accounts: HashMap<AccountId, StoredAccount>,
}

/// Account storage with optional file persistence
pub struct UserStorage {
    /// Path to the storage file, `None` for memory only
    path: Option<PathBuf>,
    /// In-memory cache of accounts
    data: Arc<RwLock<StoredData>>,
    /// One async mutex per account, created on first use
    locks: Mutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,
}

impl UserStorage {
    /// Create storage at the default path
    ///
    /// Loads existing data from disk if present.
    pub async fn new() -> StoreResult<Self> {
        let path = Self::default_path()?;
        Self::with_path(path).await
    }

    /// Create memory-only storage
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Arc::new(RwLock::new(StoredData::default())),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create storage at a specific path
    pub async fn with_path(path: PathBuf) -> StoreResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Load existing data or create empty
        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(data) => {
                    info!("Loaded account storage from {:?}", path);
                    data
                }
                Err(e) => {
                    warn!("Failed to parse account storage, starting fresh: {}", e);
                    StoredData::default()
                }
            }
        } else {
            debug!("No existing account storage, creating new");
            StoredData::default()
        };

        Ok(Self {
            path: Some(path),
            data: Arc::new(RwLock::new(data)),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Get the default storage path (~/.config/devicetoken/accounts.json)
    pub fn default_path() -> StoreResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(StoreError::NoConfigDir)?;
        Ok(config_dir.join("devicetoken").join("accounts.json"))
    }

    /// Write `data` to disk
    ///
    /// Callers hold the write guard, so snapshots reach the file in the order
    /// they were taken. The temp file and rename keep readers from seeing a
    /// partial write.
    fn persist(&self, data: &StoredData) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved account storage to {:?}", path);
        Ok(())
    }

    /// Add or update an account, keeping its existing devices
    pub async fn save_account(&self, account: Account) -> StoreResult<()> {
        let id = account.id.clone();
        let mut data = self.data.write().await;
        match data.accounts.get_mut(&id) {
            Some(stored) => stored.account = account,
            None => {
                data.accounts.insert(
                    id.clone(),
                    StoredAccount {
                        account,
                        devices: DeviceMap::new(),
                    },
                );
            }
        }
        self.persist(&data)?;
        info!("Saved account {}", id);
        Ok(())
    }

    /// Enable or disable an account
    pub async fn set_disabled(&self, id: &AccountId, disabled: bool) -> StoreResult<()> {
        let mut data = self.data.write().await;
        let stored = data
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        stored.account.disabled = disabled;
        self.persist(&data)
    }

    /// List all accounts
    pub async fn list_accounts(&self) -> Vec<Account> {
        let data = self.data.read().await;
        let mut accounts: Vec<_> = data.accounts.values().map(|s| s.account.clone()).collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        accounts
    }

    /// Remove an account and its devices
    pub async fn remove_account(&self, id: &AccountId) -> StoreResult<()> {
        let mut data = self.data.write().await;
        if data.accounts.remove(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.locks.lock().remove(id);
        self.persist(&data)?;
        info!("Removed account {}", id);
        Ok(())
    }

    fn account_mutex(&self, id: &AccountId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl UserStore for UserStorage {
    async fn find_account(&self, id: &AccountId) -> StoreResult<Account> {
        let data = self.data.read().await;
        data.accounts
            .get(id)
            .map(|s| s.account.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn load_devices(&self, id: &AccountId) -> StoreResult<DeviceMap> {
        let data = self.data.read().await;
        data.accounts
            .get(id)
            .map(|s| s.devices.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_devices(&self, id: &AccountId, update: DeviceUpdate<'_>) -> StoreResult<()> {
        let mut data = self.data.write().await;
        let stored = data
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        update(&mut stored.devices);
        self.persist(&data)
    }

    async fn lock_account(&self, id: &AccountId) -> StoreResult<AccountLock> {
        let mutex = self.account_mutex(id);
        let guard = mutex.lock_owned().await;
        debug!("Acquired lock for account {}", id);
        Ok(AccountLock::new(guard))
    }

    async fn is_domain_valid(&self, account: &Account) -> bool {
        !account.disabled && !account.id.as_str().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SecretHash;
    use chrono::{Duration, Utc};
    use devicetoken_core::ClientId;
    use tempfile::tempdir;

    fn add_device(client: &str) -> DeviceUpdate<'static> {
        let client = ClientId::from(client);
        Box::new(move |devices: &mut DeviceMap| {
            let now = Utc::now();
            devices.insert_issued(client, SecretHash::of("raw"), now, now + Duration::hours(1));
        })
    }

    #[tokio::test]
    async fn test_storage_crud() {
        let storage = UserStorage::in_memory();
        let id = AccountId::from("alice");

        storage
            .save_account(Account::new("alice").with_name("Alice"))
            .await
            .unwrap();
        let loaded = storage.find_account(&id).await.unwrap();
        assert_eq!(loaded.name, "Alice");

        storage.update_devices(&id, add_device("web")).await.unwrap();
        let devices = storage.load_devices(&id).await.unwrap();
        assert!(devices.contains(&ClientId::from("web")));

        // Updating the account keeps its devices
        storage
            .save_account(Account::new("alice").with_name("Alice B."))
            .await
            .unwrap();
        assert_eq!(storage.load_devices(&id).await.unwrap().len(), 1);

        assert_eq!(storage.list_accounts().await.len(), 1);
        storage.remove_account(&id).await.unwrap();
        assert!(matches!(
            storage.find_account(&id).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_account() {
        let storage = UserStorage::in_memory();
        let id = AccountId::from("ghost");
        assert!(matches!(
            storage.load_devices(&id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            storage.update_devices(&id, add_device("web")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_storage_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test_accounts.json");
        let id = AccountId::from("bob");

        {
            let storage = UserStorage::with_path(path.clone()).await.unwrap();
            storage.save_account(Account::new("bob")).await.unwrap();
            storage.update_devices(&id, add_device("phone")).await.unwrap();
        }

        // Reload from disk
        let storage = UserStorage::with_path(path.clone()).await.unwrap();
        let devices = storage.load_devices(&id).await.unwrap();
        let record = devices.get(&ClientId::from("phone")).unwrap();
        assert!(record.secret_hash.matches("raw"));

        let on_disk = std::fs::read_to_string(path).unwrap();
        assert!(!on_disk.contains("\"raw\""));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_all_reach_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let id = AccountId::from("bob");

        let storage = Arc::new(UserStorage::with_path(path.clone()).await.unwrap());
        storage.save_account(Account::new("bob")).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let storage = storage.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    storage
                        .update_devices(&id, add_device(&format!("client-{}", i)))
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        drop(storage);

        // The last write on disk carries every device
        let reloaded = UserStorage::with_path(path.clone()).await.unwrap();
        assert_eq!(reloaded.load_devices(&id).await.unwrap().len(), 16);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_domain_validity() {
        let storage = UserStorage::in_memory();
        let id = AccountId::from("carol");
        storage.save_account(Account::new("carol")).await.unwrap();
        let account = storage.find_account(&id).await.unwrap();
        assert!(storage.is_domain_valid(&account).await);

        storage.set_disabled(&id, true).await.unwrap();
        let account = storage.find_account(&id).await.unwrap();
        assert!(!storage.is_domain_valid(&account).await);
    }

    #[tokio::test]
    async fn test_account_locks_are_per_account() {
        let storage = UserStorage::in_memory();
        let alice = AccountId::from("alice");
        let bob = AccountId::from("bob");

        let _held = storage.lock_account(&alice).await.unwrap();
        // A different account is not blocked
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            storage.lock_account(&bob),
        )
        .await;
        assert!(other.is_ok());

        // The same account is
        let same = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            storage.lock_account(&alice),
        )
        .await;
        assert!(same.is_err());
    }
}
