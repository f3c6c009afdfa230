//! Redis-backed shared store.
//!
//! Uses a `ConnectionManager` (automatic reconnection) cloned per call.
//! The occupancy claim runs as a Lua script so the sweep, the count and the
//! write are executed by Redis as one atomic step.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{format_timestamp, ClaimOutcome, FieldClaim, KeyValueStore};
use crate::error::StoreError;

/// Number of keys requested per SCAN iteration.
const SCAN_BATCH: usize = 500;

/// KEYS[1] = resource, ARGV = holder, now, expiration, limit (-1 = unbounded), key ttl ms.
/// Returns 0 when full, 1 when already held, 2 when claimed.
const CLAIM_SCRIPT: &str = r#"
local entries = redis.call('HGETALL', KEYS[1])
local now = tonumber(ARGV[2])
for i = 1, #entries, 2 do
  local expiration = tonumber(entries[i + 1])
  if expiration == nil or expiration < now then
    redis.call('HDEL', KEYS[1], entries[i])
  end
end
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  return 1
end
local limit = tonumber(ARGV[4])
if limit >= 0 and redis.call('HLEN', KEYS[1]) >= limit then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return 2
"#;

/// Shared store backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    claim_script: redis::Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        tracing::info!(url = redis_url, "Connected to shared store");
        Ok(Self::from_connection(redis))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            claim_script: redis::Script::new(CLAIM_SCRIPT),
        }
    }
}

fn as_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(as_millis(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(as_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.redis.clone();
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2: missing key, -1: no expiry
        if millis < 0 {
            return Ok(None);
        }
        Ok(Some(Duration::from_millis(millis as u64)))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.redis.clone();
        let values: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(values)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize, StoreError> {
        if fields.is_empty() {
            return Ok(0);
        }

        let mut conn = self.redis.clone();
        let removed: usize = conn.hdel(key, fields).await?;
        Ok(removed)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        // SCAN may return a key more than once
        let mut keys = BTreeSet::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys.into_iter().collect())
    }

    async fn claim_field(&self, claim: &FieldClaim) -> Result<ClaimOutcome, StoreError> {
        let mut conn = self.redis.clone();
        let limit: i64 = claim.limit.map(|l| l as i64).unwrap_or(-1);

        let code: i64 = self
            .claim_script
            .key(&claim.key)
            .arg(&claim.field)
            .arg(format_timestamp(claim.now))
            .arg(format_timestamp(claim.expiration))
            .arg(limit)
            .arg(as_millis(claim.key_ttl))
            .invoke_async(&mut conn)
            .await?;

        match code {
            2 => Ok(ClaimOutcome::Claimed),
            1 => Ok(ClaimOutcome::AlreadyHeld),
            0 => Ok(ClaimOutcome::Full),
            other => Err(StoreError::InvalidValue {
                key: claim.key.clone(),
                value: other.to_string(),
            }),
        }
    }
}
