//! Bounded-occupancy distributed locks.
//!
//! A lock is a hash keyed by resource id whose fields are holder ids and
//! whose values are per-holder expiration timestamps. Up to `limit` holders
//! may hold a resource at once. Expired holders are swept inside every
//! acquire; reads return the raw map and leave freshness to the caller.
//!
//! Releasing never deletes a holder. The entry is rewritten to expire a few
//! seconds in the future so that concurrent requests which already read the
//! pre-release state (for example from a replica) cannot hand the freed slot
//! out twice before the store converges.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::keys::KeySpace;
use crate::clock::Clock;
use crate::config::DEFAULT_RELEASE_DELAY;
use crate::error::StoreError;
use crate::kv::{format_timestamp, parse_timestamp, ClaimOutcome, FieldClaim, KeyValueStore};

/// Lock manager bound to one lock duration.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    duration: Duration,
    release_delay: Duration,
}

impl LockManager {
    /// Creates a lock manager whose locks last `duration`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        duration: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            duration,
            release_delay: DEFAULT_RELEASE_DELAY,
        }
    }

    /// Sets the grace window applied on release.
    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    /// Lock duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Acquires `resource_id` for `holder_id` if fewer than `limit` live holders exist.
    ///
    /// Re-acquiring a lock the holder already has succeeds without touching
    /// its expiration. `limit = None` means unbounded.
    pub async fn acquire_lock(
        &self,
        resource_id: &str,
        holder_id: &str,
        limit: Option<usize>,
    ) -> Result<bool, StoreError> {
        Ok(self.try_acquire(resource_id, holder_id, limit).await?.is_held())
    }

    /// Like [`LockManager::acquire_lock`] but reports how the claim resolved.
    pub async fn try_acquire(
        &self,
        resource_id: &str,
        holder_id: &str,
        limit: Option<usize>,
    ) -> Result<ClaimOutcome, StoreError> {
        let now = self.clock.now();
        let claim = FieldClaim {
            key: resource_id.to_string(),
            field: holder_id.to_string(),
            now,
            expiration: now + self.duration.as_secs_f64(),
            limit,
            key_ttl: self.duration,
        };

        let outcome = self.store.claim_field(&claim).await?;
        debug!(
            resource_id,
            holder_id,
            limit = ?limit,
            outcome = outcome.as_str(),
            "Lock acquire attempted"
        );
        Ok(outcome)
    }

    /// Returns true iff the holder has an entry that has not yet expired.
    pub async fn has_lock(&self, resource_id: &str, holder_id: &str) -> Result<bool, StoreError> {
        let Some(raw) = self.store.hget(resource_id, holder_id).await? else {
            return Ok(false);
        };
        let expiration = parse_timestamp(resource_id, &raw)?;
        Ok(expiration > self.clock.now())
    }

    /// Releases the holder after the release delay.
    ///
    /// Holders that have no entry are left alone so a stray release cannot
    /// occupy a slot.
    pub async fn release_lock(&self, resource_id: &str, holder_id: &str) -> Result<(), StoreError> {
        if self.store.hget(resource_id, holder_id).await?.is_none() {
            return Ok(());
        }

        let expiration = self.clock.now() + self.release_delay.as_secs_f64();
        self.store
            .hset(resource_id, holder_id, &format_timestamp(expiration))
            .await
    }

    /// Returns every holder with its expiration, expired entries included.
    pub async fn get_locks(&self, resource_id: &str) -> Result<HashMap<String, f64>, StoreError> {
        let raw = self.store.hget_all(resource_id).await?;
        let mut locks = HashMap::with_capacity(raw.len());
        for (holder, value) in raw {
            match parse_timestamp(resource_id, &value) {
                Ok(expiration) => {
                    locks.insert(holder, expiration);
                }
                Err(e) => warn!(error = %e, "Skipping unreadable lock entry"),
            }
        }
        Ok(locks)
    }

    /// Removes expired holders from a resource, returning how many were dropped.
    pub async fn release_expired_locks(&self, resource_id: &str) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let raw = self.store.hget_all(resource_id).await?;
        let expired: Vec<String> = raw
            .into_iter()
            .filter(|(_, value)| parse_timestamp(resource_id, value).map_or(true, |e| e < now))
            .map(|(holder, _)| holder)
            .collect();

        self.store.hdel(resource_id, &expired).await
    }

    /// Seconds until `expiration`, negative once it has passed.
    pub fn seconds_remaining(&self, expiration: f64) -> f64 {
        expiration - self.clock.now()
    }

    // =========================================================================
    // Reservation primitives
    // =========================================================================

    /// Writes a single-owner reservation marker lasting the lock duration plus `grace`.
    pub async fn acquire_reserve_task_lock(
        &self,
        resource_id: &str,
        grace: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        self.release_expired_reserve_task_lock(resource_id, now)
            .await?;

        let ttl = self.duration + grace;
        self.store
            .set(
                resource_id,
                &format_timestamp(now + ttl.as_secs_f64()),
                Some(ttl),
            )
            .await?;
        Ok(true)
    }

    /// Shortens a reservation so it lapses after `expiry`.
    ///
    /// Returns false when the reservation no longer exists.
    pub async fn release_reserve_task_lock(
        &self,
        resource_id: &str,
        expiry: Duration,
    ) -> Result<bool, StoreError> {
        if !self.store.expire(resource_id, expiry).await? {
            return Ok(false);
        }

        let expiration = self.clock.now() + expiry.as_secs_f64();
        self.store
            .set(resource_id, &format_timestamp(expiration), Some(expiry))
            .await?;
        Ok(true)
    }

    /// Lists live reservation keys for a project.
    ///
    /// `None` arguments are wildcards. With `exclude_user`, keys belonging
    /// to `user_id` are dropped and every other user's keys are returned.
    pub async fn get_task_category_lock(
        &self,
        project_id: i64,
        user_id: Option<i64>,
        category: Option<&str>,
        exclude_user: bool,
        task_id: Option<i64>,
    ) -> Result<Vec<String>, StoreError> {
        let pattern_user = if exclude_user { None } else { user_id };
        let pattern = self
            .keys
            .reservation_pattern(project_id, category, pattern_user, task_id);
        let candidates = self.store.scan_keys(&pattern).await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let now = self.clock.now();
        let values = self.store.mget(&candidates).await?;
        let keys = candidates
            .into_iter()
            .zip(values)
            .filter(|(key, value)| {
                value
                    .as_deref()
                    .and_then(|v| parse_timestamp(key, v).ok())
                    .is_some_and(|expiration| expiration >= now)
            })
            .map(|(key, _)| key)
            .filter(|key| {
                !exclude_user
                    || user_id.is_none()
                    || self
                        .keys
                        .parse_reservation_key(key)
                        .is_some_and(|parsed| Some(parsed.user_id) != user_id)
            })
            .collect();
        Ok(keys)
    }

    async fn release_expired_reserve_task_lock(
        &self,
        resource_id: &str,
        now: f64,
    ) -> Result<(), StoreError> {
        let Some(raw) = self.store.get(resource_id).await? else {
            return Ok(());
        };
        if parse_timestamp(resource_id, &raw).map_or(true, |expiration| expiration < now) {
            self.store.delete(resource_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryStore;
    use crate::locks::keys::ReservationKey;

    fn manager(clock: Arc<ManualClock>) -> LockManager {
        let store = Arc::new(MemoryStore::new(clock.clone()));
        LockManager::new(store, clock, KeySpace::new("t"), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_acquire_respects_limit() {
        let clock = Arc::new(ManualClock::default());
        let locks = manager(clock);

        assert!(locks.acquire_lock("r", "1", Some(2)).await.unwrap());
        assert!(locks.acquire_lock("r", "2", Some(2)).await.unwrap());
        assert!(!locks.acquire_lock("r", "3", Some(2)).await.unwrap());
        assert_eq!(locks.get_locks("r").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reacquire_is_idempotent_and_keeps_expiration() {
        let clock = Arc::new(ManualClock::default());
        let locks = manager(clock.clone());

        assert!(locks.acquire_lock("r", "1", Some(1)).await.unwrap());
        let first = locks.get_locks("r").await.unwrap()["1"];

        clock.advance(30.0);
        assert_eq!(
            locks.try_acquire("r", "1", Some(1)).await.unwrap(),
            ClaimOutcome::AlreadyHeld
        );
        assert_eq!(locks.get_locks("r").await.unwrap()["1"], first);
    }

    #[tokio::test]
    async fn test_release_is_delayed() {
        let clock = Arc::new(ManualClock::default());
        let locks = manager(clock.clone());

        locks.acquire_lock("r", "1", Some(1)).await.unwrap();
        locks.release_lock("r", "1").await.unwrap();

        // Still visible and still held during the grace window
        assert!(locks.get_locks("r").await.unwrap().contains_key("1"));
        assert!(locks.has_lock("r", "1").await.unwrap());
        assert!(!locks.acquire_lock("r", "2", Some(1)).await.unwrap());

        clock.advance(4.9);
        assert!(locks.has_lock("r", "1").await.unwrap());

        clock.advance(0.2);
        assert!(!locks.has_lock("r", "1").await.unwrap());
        assert!(locks.get_locks("r").await.unwrap().contains_key("1"));
        assert!(locks.acquire_lock("r", "2", Some(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_of_unknown_holder_is_noop() {
        let clock = Arc::new(ManualClock::default());
        let locks = manager(clock);

        locks.release_lock("r", "ghost").await.unwrap();
        assert!(locks.get_locks("r").await.unwrap().is_empty());
        assert!(locks.acquire_lock("r", "1", Some(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_expired_locks() {
        let clock = Arc::new(ManualClock::default());
        let locks = manager(clock.clone());

        locks.acquire_lock("r", "1", None).await.unwrap();
        clock.advance(30.0);
        locks.acquire_lock("r", "2", None).await.unwrap();
        clock.advance(31.0);

        assert_eq!(locks.release_expired_locks("r").await.unwrap(), 1);
        let remaining = locks.get_locks("r").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining.contains_key("2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_never_exceeds_limit() {
        let clock = Arc::new(ManualClock::default());
        let locks = Arc::new(manager(clock));

        let mut handles = Vec::new();
        for holder in 0..32 {
            let locks = Arc::clone(&locks);
            handles.push(tokio::spawn(async move {
                locks
                    .acquire_lock("contended", &holder.to_string(), Some(3))
                    .await
                    .expect("acquire should not fail")
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.expect("task should not panic") {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 3);
        assert_eq!(locks.get_locks("contended").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_reservation_lifecycle() {
        let clock = Arc::new(ManualClock::default());
        let locks = manager(clock.clone());
        let keys = KeySpace::new("t");

        let mine = keys.reservation_key(&ReservationKey {
            project_id: 1,
            category: "subject:math".to_string(),
            user_id: 5,
            task_id: 10,
        });
        let theirs = keys.reservation_key(&ReservationKey {
            project_id: 1,
            category: "subject:art".to_string(),
            user_id: 6,
            task_id: 11,
        });

        assert!(locks
            .acquire_reserve_task_lock(&mine, Duration::from_secs(1800))
            .await
            .unwrap());
        assert!(locks
            .acquire_reserve_task_lock(&theirs, Duration::from_secs(1800))
            .await
            .unwrap());

        let own = locks
            .get_task_category_lock(1, Some(5), Some("subject:*"), false, None)
            .await
            .unwrap();
        assert_eq!(own, vec![mine.clone()]);

        let others = locks
            .get_task_category_lock(1, Some(5), Some("subject:*"), true, None)
            .await
            .unwrap();
        assert_eq!(others, vec![theirs.clone()]);

        assert!(locks
            .release_reserve_task_lock(&mine, Duration::from_secs(5))
            .await
            .unwrap());
        // Still reserved during the grace window
        assert_eq!(
            locks
                .get_task_category_lock(1, Some(5), None, false, None)
                .await
                .unwrap()
                .len(),
            1
        );

        clock.advance(6.0);
        assert!(locks
            .get_task_category_lock(1, Some(5), None, false, None)
            .await
            .unwrap()
            .is_empty());
        assert!(!locks
            .release_reserve_task_lock(&mine, Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_reservation_outlives_lock_duration() {
        let clock = Arc::new(ManualClock::default());
        let locks = manager(clock.clone());

        locks
            .acquire_reserve_task_lock(
                "t:reserve_task:project:1:category:a:b:user:1:task:1",
                Duration::from_secs(1800),
            )
            .await
            .unwrap();

        clock.advance(60.0 + 1799.0);
        assert_eq!(
            locks
                .get_task_category_lock(1, Some(1), None, false, None)
                .await
                .unwrap()
                .len(),
            1
        );

        clock.advance(2.0);
        assert!(locks
            .get_task_category_lock(1, Some(1), None, false, None)
            .await
            .unwrap()
            .is_empty());
    }
}
