//! In-process shared store.
//!
//! Mirrors the subset of Redis semantics the core relies on: scalar and hash
//! values, whole-key TTLs evaluated against an injected [`Clock`], and glob
//! pattern key enumeration. Every operation holds the store mutex for its
//! full duration, so each call is atomic just like a single Redis command.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{format_timestamp, ClaimOutcome, FieldClaim, KeyValueStore};
use crate::clock::Clock;
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Scalar(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<f64>,
}

/// Shared store held entirely in memory.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Creates an empty store whose TTLs are evaluated with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries();
        entries.values().filter(|e| is_live(e, now)).count()
    }

    /// Returns true when no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks the map and drops `key` if its TTL has passed.
    fn live_entries(&self, key: &str) -> (MutexGuard<'_, HashMap<String, Entry>>, f64) {
        let now = self.clock.now();
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|e| !is_live(e, now)) {
            entries.remove(key);
        }
        (entries, now)
    }
}

fn is_live(entry: &Entry, now: f64) -> bool {
    entry.expires_at.is_none_or(|at| at > now)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::InvalidValue {
        key: key.to_string(),
        value: "WRONGTYPE".to_string(),
    }
}

/// Translates a Redis-style glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, StoreError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                re.push_str(&regex::escape(&literal));
                literal.clear();
                re.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    re.push_str(&regex::escape(&literal));
    re.push('$');

    Regex::new(&re).map_err(|e| StoreError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let (entries, _) = self.live_entries(key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Scalar(v)) => Ok(Some(v.clone())),
            Some(Value::Hash(_)) => Err(wrong_type(key)),
        }
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let now = self.clock.now();
        let entries = self.entries();
        Ok(keys
            .iter()
            .map(|key| match entries.get(key) {
                Some(Entry {
                    value: Value::Scalar(v),
                    expires_at,
                }) if expires_at.is_none_or(|at| at > now) => Some(v.clone()),
                _ => None,
            })
            .collect())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (mut entries, now) = self.live_entries(key);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Scalar(value.to_string()),
                expires_at: ttl.map(|t| now + t.as_secs_f64()),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let (mut entries, now) = self.live_entries(key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl.as_secs_f64());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let (entries, now) = self.live_entries(key);
        Ok(entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| Duration::from_secs_f64((at - now).max(0.0))))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let (entries, _) = self.live_entries(key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Some(Value::Scalar(_)) => Err(wrong_type(key)),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let (entries, _) = self.live_entries(key);
        match entries.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(Value::Scalar(_)) => Err(wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let (mut entries, _) = self.live_entries(key);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Value::Scalar(_) => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize, StoreError> {
        let (mut entries, _) = self.live_entries(key);
        let Some(entry) = entries.get_mut(key) else {
            return Ok(0);
        };
        let Value::Hash(h) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        let removed = fields.iter().filter(|f| h.remove(*f).is_some()).count();
        // Redis drops a hash once its last field is gone
        if h.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let re = glob_to_regex(pattern)?;
        let now = self.clock.now();
        let entries = self.entries();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| is_live(e, now) && re.is_match(k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn claim_field(&self, claim: &FieldClaim) -> Result<ClaimOutcome, StoreError> {
        let (mut entries, _) = self.live_entries(&claim.key);
        let entry = entries.entry(claim.key.clone()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        let Value::Hash(holders) = &mut entry.value else {
            return Err(wrong_type(&claim.key));
        };

        holders.retain(|_, raw| {
            raw.trim()
                .parse::<f64>()
                .is_ok_and(|expiration| expiration >= claim.now)
        });

        if holders.contains_key(&claim.field) {
            return Ok(ClaimOutcome::AlreadyHeld);
        }

        if claim.limit.is_some_and(|limit| holders.len() >= limit) {
            if holders.is_empty() {
                entries.remove(&claim.key);
            }
            return Ok(ClaimOutcome::Full);
        }

        holders.insert(claim.field.clone(), format_timestamp(claim.expiration));
        entry.expires_at = Some(claim.now + claim.key_ttl.as_secs_f64());
        Ok(ClaimOutcome::Claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::new(1000.0));
        let store = MemoryStore::new(clock.clone());
        (clock, store)
    }

    fn claim(field: &str, limit: Option<usize>, now: f64) -> FieldClaim {
        FieldClaim {
            key: "res".to_string(),
            field: field.to_string(),
            now,
            expiration: now + 60.0,
            limit,
            key_ttl: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_scalar_ttl_expires() {
        let (clock, store) = store();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(9.0);
        assert_eq!(
            store.ttl("k").await.unwrap(),
            Some(Duration::from_secs(1))
        );

        clock.advance(1.0);
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_mget_preserves_order() {
        let (_, store) = store();
        store.set("a", "1", None).await.unwrap();
        store.set("c", "3", None).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = store.mget(&keys).await.unwrap();
        assert_eq!(
            values,
            vec![Some("1".to_string()), None, Some("3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let (_, store) = store();
        store.hset("h", "f1", "1").await.unwrap();
        store.hset("h", "f2", "2").await.unwrap();
        assert_eq!(store.hget("h", "f1").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.hget_all("h").await.unwrap().len(), 2);

        let removed = store
            .hdel("h", &["f1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        store.hdel("h", &["f2".to_string()]).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type_is_an_error() {
        let (_, store) = store();
        store.set("s", "v", None).await.unwrap();
        assert!(store.hget("s", "f").await.is_err());
        assert!(store.hset("s", "f", "v").await.is_err());
    }

    #[tokio::test]
    async fn test_scan_keys_glob() {
        let (_, store) = store();
        store.set("reserve:project:1:user:2", "x", None).await.unwrap();
        store.set("reserve:project:1:user:3", "x", None).await.unwrap();
        store.set("reserve:project:10:user:2", "x", None).await.unwrap();
        store.set("other.key", "x", None).await.unwrap();

        let keys = store.scan_keys("reserve:project:1:user:*").await.unwrap();
        assert_eq!(
            keys,
            vec!["reserve:project:1:user:2", "reserve:project:1:user:3"]
        );

        // Regex metacharacters in the pattern are literal
        assert_eq!(store.scan_keys("other.key").await.unwrap().len(), 1);
        assert!(store.scan_keys("other?key").await.unwrap().len() == 1);
        assert!(store.scan_keys("otherxkey").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_field_respects_limit() {
        let (_, store) = store();
        assert_eq!(
            store.claim_field(&claim("1", Some(2), 1000.0)).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim_field(&claim("2", Some(2), 1000.0)).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim_field(&claim("3", Some(2), 1000.0)).await.unwrap(),
            ClaimOutcome::Full
        );
        assert_eq!(
            store.claim_field(&claim("1", Some(2), 1000.0)).await.unwrap(),
            ClaimOutcome::AlreadyHeld
        );
    }

    #[tokio::test]
    async fn test_claim_field_sweeps_expired_holders() {
        let (clock, store) = store();
        store
            .claim_field(&claim("1", Some(1), 1000.0))
            .await
            .unwrap();

        clock.advance(61.0);
        let outcome = store
            .claim_field(&claim("2", Some(1), clock.now()))
            .await
            .unwrap();
        // The whole key expired together with its only holder
        assert_eq!(outcome, ClaimOutcome::Claimed);
        assert!(store.hget("res", "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_field_unbounded() {
        let (_, store) = store();
        for i in 0..50 {
            let outcome = store
                .claim_field(&claim(&i.to_string(), None, 1000.0))
                .await
                .unwrap();
            assert_eq!(outcome, ClaimOutcome::Claimed);
        }
        assert_eq!(store.hget_all("res").await.unwrap().len(), 50);
    }
}
