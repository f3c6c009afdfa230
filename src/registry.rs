//! Per-project registry of active users.
//!
//! A user is active in a project while holding at least one lock there.
//! Entries map holder id to expiration and follow the same lazy-sweep and
//! delayed-release rules as task locks. The live count sizes candidate
//! batches: more concurrent users means a larger batch to lock from.

use std::time::Duration;

use tracing::debug;

use crate::error::StoreError;
use crate::kv::{format_timestamp, parse_timestamp};
use crate::locks::LockContext;

/// Active-user registry over the shared store.
#[derive(Clone)]
pub struct ActiveUserRegistry {
    ctx: LockContext,
}

impl ActiveUserRegistry {
    pub fn new(ctx: LockContext) -> Self {
        Self { ctx }
    }

    /// Marks `holder_id` active in the project for `ttl`.
    pub async fn register_active_user(
        &self,
        project_id: i64,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = self.ctx.keys.active_users_key(project_id);
        let expiration = self.ctx.now() + ttl.as_secs_f64();
        self.ctx
            .store
            .hset(&key, holder_id, &format_timestamp(expiration))
            .await?;

        // Never shorten the hash lifetime below another member's entry
        let current = self.ctx.store.ttl(&key).await?;
        if current.is_none_or(|remaining| remaining < ttl) {
            self.ctx.store.expire(&key, ttl).await?;
        }
        Ok(())
    }

    /// Lets the holder's entry lapse after the release delay.
    pub async fn unregister_active_user(
        &self,
        project_id: i64,
        holder_id: &str,
    ) -> Result<(), StoreError> {
        let key = self.ctx.keys.active_users_key(project_id);
        if self.ctx.store.hget(&key, holder_id).await?.is_none() {
            return Ok(());
        }

        let expiration = self.ctx.now() + self.ctx.config.release_delay.as_secs_f64();
        self.ctx
            .store
            .hset(&key, holder_id, &format_timestamp(expiration))
            .await?;
        debug!(project_id, holder_id, "Active user unregistered");
        Ok(())
    }

    /// Sweeps expired entries and returns the live count.
    pub async fn get_active_user_count(&self, project_id: i64) -> Result<usize, StoreError> {
        Ok(self.get_active_users(project_id).await?.len())
    }

    /// Sweeps expired entries and returns the live holder ids, sorted.
    pub async fn get_active_users(&self, project_id: i64) -> Result<Vec<String>, StoreError> {
        let key = self.ctx.keys.active_users_key(project_id);
        let now = self.ctx.now();
        let entries = self.ctx.store.hget_all(&key).await?;

        let (live, expired): (Vec<_>, Vec<_>) = entries.into_iter().partition(|(_, value)| {
            parse_timestamp(&key, value).is_ok_and(|expiration| expiration >= now)
        });

        let expired: Vec<String> = expired.into_iter().map(|(holder, _)| holder).collect();
        if !expired.is_empty() {
            self.ctx.store.hdel(&key, &expired).await?;
        }

        let mut users: Vec<String> = live.into_iter().map(|(holder, _)| holder).collect();
        users.sort();
        Ok(users)
    }
}
