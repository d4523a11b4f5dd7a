//! Per-account device token records
//!
//! A [`DeviceMap`] holds at most one [`TokenRecord`] per client id. Records
//! only ever store digests of the raw token; the plaintext is handed out once
//! by the manager and never kept.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use devicetoken_core::{ClientId, Rejection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

/// SHA-256 digest of a raw token, base64 encoded
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretHash(String);

impl SecretHash {
    /// Hash a raw token for storage
    pub fn of(raw: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        Self(BASE64.encode(hasher.finalize()))
    }

    /// Constant-time comparison against a presented raw token
    pub fn matches(&self, raw: &str) -> bool {
        let presented = Self::of(raw);
        self.0.as_bytes().ct_eq(presented.0.as_bytes()).into()
    }
}

impl std::fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretHash(..)")
    }
}

/// Server-side state for one (account, client) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Digest of the live token
    pub secret_hash: SecretHash,
    /// Digest of the token replaced by the last rotation, honored during the
    /// grace window only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_secret_hash: Option<SecretHash>,
    /// When this client slot was first issued a token
    pub issued_at: DateTime<Utc>,
    /// When the live token stops being accepted
    pub expires_at: DateTime<Utc>,
    /// Last issue or rotation
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether a prior secret would still be honored at `now`
    pub fn in_grace_window(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now >= self.updated_at && now - self.updated_at <= grace
    }
}

/// Which stored digest a presented token matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretMatch {
    /// The live secret
    Current,
    /// The secret replaced by the most recent rotation, within the grace window
    Previous,
}

/// Mapping from client id to token record for a single account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceMap {
    records: HashMap<ClientId, TokenRecord>,
}

impl DeviceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&TokenRecord> {
        self.records.get(client_id)
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.records.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &TokenRecord)> {
        self.records.iter()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Replace the record for `client_id` with a fresh one, discarding any
    /// previous secret
    pub(crate) fn insert_issued(
        &mut self,
        client_id: ClientId,
        secret_hash: SecretHash,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> &TokenRecord {
        let issued_at = self
            .records
            .get(&client_id)
            .map(|r| r.issued_at)
            .unwrap_or(now);
        let record = TokenRecord {
            secret_hash,
            last_secret_hash: None,
            issued_at,
            expires_at,
            updated_at: now,
        };
        self.records.insert(client_id.clone(), record);
        &self.records[&client_id]
    }

    /// Swap in a new secret, keeping the outgoing one as the single prior
    /// secret. Expiry never moves backwards.
    pub(crate) fn insert_rotated(
        &mut self,
        client_id: ClientId,
        secret_hash: SecretHash,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> &TokenRecord {
        let Some(record) = self.records.get_mut(&client_id) else {
            return self.insert_issued(client_id, secret_hash, now, expires_at);
        };
        record.last_secret_hash = Some(std::mem::replace(&mut record.secret_hash, secret_hash));
        record.expires_at = record.expires_at.max(expires_at);
        record.updated_at = now;
        &self.records[&client_id]
    }

    /// Check a presented raw token against the record for `client_id`
    pub fn check(
        &self,
        client_id: &ClientId,
        raw: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<SecretMatch, Rejection> {
        let record = self.records.get(client_id).ok_or(Rejection::UnknownDevice)?;
        if record.is_expired(now) {
            return Err(Rejection::Expired);
        }
        if record.secret_hash.matches(raw) {
            return Ok(SecretMatch::Current);
        }
        match &record.last_secret_hash {
            Some(last) if record.in_grace_window(now, grace) && last.matches(raw) => {
                Ok(SecretMatch::Previous)
            }
            _ => Err(Rejection::SecretMismatch),
        }
    }

    /// Drop least-recently-updated records until at most `max` remain.
    /// The record for `keep` is never chosen. Returns the evicted client ids.
    pub(crate) fn evict_over(&mut self, max: usize, keep: &ClientId) -> Vec<ClientId> {
        let mut evicted = Vec::new();
        while self.records.len() > max {
            let oldest = self
                .records
                .iter()
                .filter(|(id, _)| *id != keep)
                .min_by(|(a_id, a), (b_id, b)| {
                    a.updated_at.cmp(&b.updated_at).then_with(|| a_id.cmp(b_id))
                })
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.records.remove(&id);
                    evicted.push(id);
                }
                None => break,
            }
        }
        evicted
    }

    /// Remove expired records and forget prior secrets whose grace window has
    /// elapsed. Returns the number of records removed.
    pub(crate) fn prune(&mut self, now: DateTime<Utc>, grace: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired(now));
        for record in self.records.values_mut() {
            if record.last_secret_hash.is_some() && !record.in_grace_window(now, grace) {
                record.last_secret_hash = None;
            }
        }
        before - self.records.len()
    }

    pub(crate) fn remove(&mut self, client_id: &ClientId) -> Option<TokenRecord> {
        self.records.remove(client_id)
    }

    /// Remove every record except the one for `keep`, if any
    pub(crate) fn retain_only(&mut self, keep: Option<&ClientId>) -> usize {
        let before = self.records.len();
        self.records.retain(|id, _| Some(id) == keep);
        before - self.records.len()
    }
}

/// Summary information about a device record for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub client_id: String,
    pub issued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DeviceInfo {
    pub fn from_record(client_id: &ClientId, record: &TokenRecord) -> Self {
        Self {
            client_id: client_id.to_string(),
            issued_at: record.issued_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn day() -> Duration {
        Duration::hours(24)
    }

    #[test]
    fn test_secret_hash_matches_only_its_token() {
        let hash = SecretHash::of("abc");
        assert!(hash.matches("abc"));
        assert!(!hash.matches("abd"));
        assert!(!hash.matches(""));
        assert_eq!(format!("{:?}", hash), "SecretHash(..)");
    }

    #[test]
    fn test_issue_replaces_existing_record() {
        let mut map = DeviceMap::new();
        let web = ClientId::from("web");
        map.insert_issued(web.clone(), SecretHash::of("one"), t0(), t0() + day());
        map.insert_rotated(web.clone(), SecretHash::of("two"), t0(), t0() + day());
        map.insert_issued(
            web.clone(),
            SecretHash::of("three"),
            t0() + Duration::seconds(1),
            t0() + day(),
        );

        assert_eq!(map.len(), 1);
        let record = map.get(&web).unwrap();
        assert!(record.last_secret_hash.is_none());
        assert_eq!(record.issued_at, t0());
        assert!(map.check(&web, "two", t0(), Duration::seconds(5)).is_err());
    }

    #[test]
    fn test_rotation_keeps_one_prior_secret() {
        let mut map = DeviceMap::new();
        let web = ClientId::from("web");
        let grace = Duration::seconds(5);
        map.insert_issued(web.clone(), SecretHash::of("s1"), t0(), t0() + day());
        map.insert_rotated(web.clone(), SecretHash::of("s2"), t0(), t0() + day());
        map.insert_rotated(web.clone(), SecretHash::of("s3"), t0(), t0() + day());

        assert_eq!(map.check(&web, "s3", t0(), grace), Ok(SecretMatch::Current));
        assert_eq!(map.check(&web, "s2", t0(), grace), Ok(SecretMatch::Previous));
        assert_eq!(
            map.check(&web, "s1", t0(), grace),
            Err(Rejection::SecretMismatch)
        );
    }

    #[test]
    fn test_rotation_never_shortens_expiry() {
        let mut map = DeviceMap::new();
        let web = ClientId::from("web");
        map.insert_issued(web.clone(), SecretHash::of("s1"), t0(), t0() + day());
        map.insert_rotated(
            web.clone(),
            SecretHash::of("s2"),
            t0(),
            t0() + Duration::hours(1),
        );
        assert_eq!(map.get(&web).unwrap().expires_at, t0() + day());
    }

    #[test]
    fn test_check_fails_closed() {
        let mut map = DeviceMap::new();
        let web = ClientId::from("web");
        let grace = Duration::seconds(5);
        assert_eq!(
            map.check(&web, "x", t0(), grace),
            Err(Rejection::UnknownDevice)
        );

        map.insert_issued(web.clone(), SecretHash::of("s1"), t0(), t0() + day());
        assert_eq!(
            map.check(&web, "s1", t0() + day(), grace),
            Err(Rejection::Expired)
        );
    }

    #[test]
    fn test_evict_least_recently_updated() {
        let mut map = DeviceMap::new();
        for (i, id) in ["d1", "d2", "d3"].iter().enumerate() {
            let now = t0() + Duration::seconds(i as i64);
            map.insert_issued(ClientId::from(*id), SecretHash::of(id), now, now + day());
        }

        let evicted = map.evict_over(2, &ClientId::from("d3"));
        assert_eq!(evicted, vec![ClientId::from("d1")]);
        assert_eq!(map.client_ids(), vec![ClientId::from("d2"), ClientId::from("d3")]);
    }

    #[test]
    fn test_evict_spares_kept_record() {
        let mut map = DeviceMap::new();
        // The kept record is the oldest one here
        map.insert_issued(ClientId::from("old"), SecretHash::of("a"), t0(), t0() + day());
        let later = t0() + Duration::seconds(10);
        map.insert_issued(ClientId::from("new"), SecretHash::of("b"), later, later + day());

        let evicted = map.evict_over(1, &ClientId::from("old"));
        assert_eq!(evicted, vec![ClientId::from("new")]);
        assert!(map.contains(&ClientId::from("old")));
    }

    #[test]
    fn test_prune_drops_expired_and_lapsed_prior_secrets() {
        let mut map = DeviceMap::new();
        let grace = Duration::seconds(5);
        let short = ClientId::from("short");
        let long = ClientId::from("long");
        map.insert_issued(short.clone(), SecretHash::of("a"), t0(), t0() + Duration::seconds(30));
        map.insert_issued(long.clone(), SecretHash::of("b"), t0(), t0() + day());
        map.insert_rotated(long.clone(), SecretHash::of("c"), t0(), t0() + day());

        let removed = map.prune(t0() + Duration::seconds(60), grace);
        assert_eq!(removed, 1);
        assert!(!map.contains(&short));
        assert!(map.get(&long).unwrap().last_secret_hash.is_none());
    }

    #[test]
    fn test_retain_only() {
        let mut map = DeviceMap::new();
        for id in ["a", "b", "c"] {
            map.insert_issued(ClientId::from(id), SecretHash::of(id), t0(), t0() + day());
        }
        assert_eq!(map.retain_only(Some(&ClientId::from("b"))), 2);
        assert_eq!(map.client_ids(), vec![ClientId::from("b")]);
        assert_eq!(map.retain_only(None), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn test_device_map_serializes_without_plaintext() {
        let mut map = DeviceMap::new();
        map.insert_issued(ClientId::from("web"), SecretHash::of("plain"), t0(), t0() + day());
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.contains("\"web\""));
        assert!(!json.contains("plain"));

        let back: DeviceMap = serde_json::from_str(&json).unwrap();
        assert!(back.get(&ClientId::from("web")).unwrap().secret_hash.matches("plain"));
    }
}
