//! Contribution guard.
//!
//! Stamps when a contributor requested a task and when it was presented to
//! them. Both stamps are independent expiring keys holding an RFC 3339
//! timestamp. The caller decides whether a repeated fetch of the same task
//! is a fresh presentation or a continuation; this module only exposes the
//! primitives.

use chrono::{DateTime, Utc};

use crate::error::SchedulerError;
use crate::identity::Requester;
use crate::locks::LockContext;

/// Requested/presented timestamp store.
#[derive(Clone)]
pub struct ContributionsGuard {
    ctx: LockContext,
}

impl ContributionsGuard {
    pub fn new(ctx: LockContext) -> Self {
        Self { ctx }
    }

    fn holder(requester: &Requester) -> Result<String, SchedulerError> {
        requester
            .holder_id()
            .ok_or_else(|| SchedulerError::BadRequest("requester has no identity".to_string()))
    }

    async fn write_stamp(&self, key: &str) -> Result<(), SchedulerError> {
        let now = self.ctx.clock.now_utc().to_rfc3339();
        self.ctx
            .store
            .set(key, &now, Some(self.ctx.config.stamp_ttl))
            .await?;
        Ok(())
    }

    async fn read_stamp(&self, key: &str) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let Some(raw) = self.ctx.store.get(key).await? else {
            return Ok(None);
        };
        Ok(DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)))
    }

    // =========================================================================
    // Requested stamp
    // =========================================================================

    /// Records that the requester asked for the task.
    pub async fn stamp(&self, task_id: i64, requester: &Requester) -> Result<(), SchedulerError> {
        let key = self.ctx.keys.requested_stamp_key(task_id, &Self::holder(requester)?);
        self.write_stamp(&key).await
    }

    /// Returns true if the requested stamp exists.
    pub async fn check_task_stamped(
        &self,
        task_id: i64,
        requester: &Requester,
    ) -> Result<bool, SchedulerError> {
        Ok(self.retrieve_timestamp(task_id, requester).await?.is_some())
    }

    /// When the requester asked for the task, if the stamp is still live.
    pub async fn retrieve_timestamp(
        &self,
        task_id: i64,
        requester: &Requester,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let key = self.ctx.keys.requested_stamp_key(task_id, &Self::holder(requester)?);
        self.read_stamp(&key).await
    }

    /// Drops the requested stamp.
    pub async fn remove_task_stamped(
        &self,
        task_id: i64,
        requester: &Requester,
    ) -> Result<(), SchedulerError> {
        let key = self.ctx.keys.requested_stamp_key(task_id, &Self::holder(requester)?);
        self.ctx.store.delete(&key).await?;
        Ok(())
    }

    // =========================================================================
    // Presented stamp
    // =========================================================================

    /// Records that the task was presented to the requester.
    pub async fn stamp_presented_time(
        &self,
        task_id: i64,
        requester: &Requester,
    ) -> Result<(), SchedulerError> {
        let key = self.ctx.keys.presented_stamp_key(task_id, &Self::holder(requester)?);
        self.write_stamp(&key).await
    }

    /// Returns true if the presented stamp exists.
    pub async fn check_task_presented_timestamp(
        &self,
        task_id: i64,
        requester: &Requester,
    ) -> Result<bool, SchedulerError> {
        Ok(self
            .retrieve_presented_timestamp(task_id, requester)
            .await?
            .is_some())
    }

    /// When the task was presented, if the stamp is still live.
    pub async fn retrieve_presented_timestamp(
        &self,
        task_id: i64,
        requester: &Requester,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let key = self.ctx.keys.presented_stamp_key(task_id, &Self::holder(requester)?);
        self.read_stamp(&key).await
    }

    /// Resets the presented stamp's TTL without changing its timestamp.
    ///
    /// Returns false if there is no stamp to extend.
    pub async fn extend_task_presented_timestamp_expiry(
        &self,
        task_id: i64,
        requester: &Requester,
    ) -> Result<bool, SchedulerError> {
        let key = self.ctx.keys.presented_stamp_key(task_id, &Self::holder(requester)?);
        Ok(self
            .ctx
            .store
            .expire(&key, self.ctx.config.stamp_ttl)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::{Clock, ManualClock};
    use crate::config::SchedulerConfig;
    use crate::kv::MemoryStore;

    fn guard() -> (Arc<ManualClock>, ContributionsGuard) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let ctx = LockContext::new(store, clock.clone(), SchedulerConfig::default());
        (clock, ContributionsGuard::new(ctx))
    }

    #[tokio::test]
    async fn test_stamp_expires_after_ttl() {
        let (clock, guard) = guard();
        let user = Requester::user(3);

        assert!(!guard.check_task_stamped(1, &user).await.unwrap());
        guard.stamp(1, &user).await.unwrap();
        assert!(guard.check_task_stamped(1, &user).await.unwrap());
        assert_eq!(
            guard.retrieve_timestamp(1, &user).await.unwrap(),
            Some(clock.now_utc())
        );

        clock.advance(3601.0);
        assert!(!guard.check_task_stamped(1, &user).await.unwrap());
    }

    #[tokio::test]
    async fn test_requested_and_presented_are_independent() {
        let (_, guard) = guard();
        let user = Requester::anonymous("10.0.0.1");

        guard.stamp(1, &user).await.unwrap();
        assert!(!guard.check_task_presented_timestamp(1, &user).await.unwrap());

        guard.stamp_presented_time(1, &user).await.unwrap();
        guard.remove_task_stamped(1, &user).await.unwrap();
        assert!(!guard.check_task_stamped(1, &user).await.unwrap());
        assert!(guard.check_task_presented_timestamp(1, &user).await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_keeps_timestamp_and_resets_ttl() {
        let (clock, guard) = guard();
        let user = Requester::user(3);

        assert!(!guard
            .extend_task_presented_timestamp_expiry(1, &user)
            .await
            .unwrap());

        guard.stamp_presented_time(1, &user).await.unwrap();
        let presented = guard.retrieve_presented_timestamp(1, &user).await.unwrap();

        clock.advance(3000.0);
        assert!(guard
            .extend_task_presented_timestamp_expiry(1, &user)
            .await
            .unwrap());

        clock.advance(3000.0);
        assert_eq!(
            guard.retrieve_presented_timestamp(1, &user).await.unwrap(),
            presented
        );
    }

    #[tokio::test]
    async fn test_unidentified_requester_is_rejected() {
        let (_, guard) = guard();
        let err = guard.stamp(1, &Requester::default()).await.unwrap_err();
        assert!(err.is_client_error());
    }
}
