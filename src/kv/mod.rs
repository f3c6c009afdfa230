//! Shared expiring key/value store.
//!
//! All coordination between request handlers happens through this store:
//! locks, reservations, the active-user registry, contribution stamps and
//! the task→project reverse index. Two implementations are provided:
//!
//! - **RedisStore**: production backend over a redis `ConnectionManager`
//! - **MemoryStore**: in-process backend with clock-driven TTLs, used by
//!   tests and single-process deployments
//!
//! # Per-holder expiration
//!
//! Most stores only expire whole keys, so bounded-occupancy locks keep one
//! hash field per holder whose *value* is the holder's expiration timestamp.
//! Expired holders are swept lazily on read. The one operation that must be
//! atomic is [`KeyValueStore::claim_field`]: sweep, occupancy check and claim
//! execute as a single store-side step so two concurrent requests can never
//! both take the last slot.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

/// A request to claim one holder slot in a bounded-occupancy hash.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldClaim {
    /// Hash key of the resource.
    pub key: String,
    /// Holder field to claim.
    pub field: String,
    /// Current time; fields whose stored expiration is below it are swept first.
    pub now: f64,
    /// Expiration stored for the holder on a successful claim.
    pub expiration: f64,
    /// Maximum number of live holders, `None` for unbounded.
    pub limit: Option<usize>,
    /// Whole-key TTL refreshed on a successful claim.
    pub key_ttl: Duration,
}

/// Result of a [`FieldClaim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// A new holder entry was written.
    Claimed,
    /// The holder already had an unexpired entry; nothing was changed.
    AlreadyHeld,
    /// The resource is at its occupancy limit.
    Full,
}

impl ClaimOutcome {
    /// Returns true if the caller holds the slot after the claim.
    pub fn is_held(self) -> bool {
        matches!(self, ClaimOutcome::Claimed | ClaimOutcome::AlreadyHeld)
    }

    /// Label used for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimOutcome::Claimed => "claimed",
            ClaimOutcome::AlreadyHeld => "already_held",
            ClaimOutcome::Full => "full",
        }
    }
}

/// Atomic single-key operations over a shared store with key expiry.
///
/// No operation spans more than one key atomically.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a scalar key.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Reads several scalar keys in one round trip, preserving order.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Writes a scalar key, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Deletes a key of any type.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Sets a key's TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining TTL of a key, `None` if the key is missing or has no TTL.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Reads one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Reads every field of a hash.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Writes one hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Deletes hash fields, returning how many existed.
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize, StoreError>;

    /// Enumerates keys matching a glob pattern (`*` and `?` wildcards).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically sweeps expired holders, then claims a slot if one is free.
    async fn claim_field(&self, claim: &FieldClaim) -> Result<ClaimOutcome, StoreError>;
}

/// Parses an expiration timestamp stored as a hash field or scalar value.
pub(crate) fn parse_timestamp(key: &str, value: &str) -> Result<f64, StoreError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| StoreError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

/// Formats an expiration timestamp for storage.
pub(crate) fn format_timestamp(ts: f64) -> String {
    format!("{:.6}", ts)
}
