//! Category reservations.
//!
//! When a project uses the task-queue scheduler and configures
//! `reserve_tasks.category`, locking a task also reserves its category for
//! the user. The reservation outlives the lock by a grace period and is used
//! to steer the same user back to the same category, and other users away
//! from it.
//!
//! Reservations are single-owner keys embedding project, category, user and
//! task (see [`crate::locks::KeySpace::reservation_key`]); their value is the
//! expiration timestamp.

pub mod category;
pub mod sql;

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::locks::{LockContext, ReservationKey};
use crate::metrics::MetricsCollector;
use crate::sched::SchedulerKind;
use crate::store::{ProjectSettings, Task};

pub use category::Category;
pub use sql::{quote_literal, CategoryFilter};

/// Reservation keys together with the filter they translate into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub filter: CategoryFilter,
    pub keys: Vec<String>,
}

impl ReservationFilter {
    /// Returns true when no reservation key matched.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// SQL clause for the candidate query.
    pub fn sql(&self) -> String {
        self.filter.to_sql()
    }
}

/// Reservation layer over the shared store.
#[derive(Clone)]
pub struct ReservationService {
    ctx: LockContext,
    metrics: MetricsCollector,
}

impl ReservationService {
    pub fn new(ctx: LockContext) -> Self {
        Self {
            ctx,
            metrics: MetricsCollector::new(),
        }
    }

    /// Whether reservations are switched on for this deployment.
    pub fn enabled(&self) -> bool {
        self.ctx.config.reservation_enabled
    }

    /// Finds reservation keys for a user and turns them into a task filter.
    ///
    /// Without `exclude_user` the user's own reservations are returned and
    /// the filter selects their categories. With `exclude_user` every other
    /// user's reservations are returned and the filter selects everything
    /// outside those categories.
    pub async fn get_reserve_task_category_info(
        &self,
        reserve_fields: &[String],
        project_id: i64,
        timeout: Duration,
        user_id: Option<i64>,
        exclude_user: bool,
    ) -> Result<ReservationFilter, StoreError> {
        let Some(user_id) = user_id else {
            return Ok(ReservationFilter::default());
        };
        if !self.enabled() || reserve_fields.is_empty() {
            return Ok(ReservationFilter::default());
        }

        let pattern = Category::wildcard(reserve_fields);
        let keys = self
            .ctx
            .lock_manager(timeout)
            .get_task_category_lock(project_id, Some(user_id), Some(&pattern), exclude_user, None)
            .await?;
        if keys.is_empty() {
            return Ok(ReservationFilter::default());
        }

        debug!(
            project_id,
            user_id,
            exclude_user,
            count = keys.len(),
            "Reservation keys found"
        );
        Ok(self.reserve_task_sql_filters(project_id, &keys, exclude_user))
    }

    /// Parses reservation keys into a category filter.
    ///
    /// Keys of other projects and keys with unparsable categories are dropped.
    pub fn reserve_task_sql_filters(
        &self,
        project_id: i64,
        keys: &[String],
        negate: bool,
    ) -> ReservationFilter {
        let mut kept = Vec::with_capacity(keys.len());
        let mut categories = Vec::with_capacity(keys.len());

        for key in keys {
            let parsed = self
                .ctx
                .keys
                .parse_reservation_key(key)
                .filter(|parsed| parsed.project_id == project_id)
                .and_then(|parsed| Category::parse(&parsed.category));
            match parsed {
                Some(category) => {
                    categories.push(category);
                    kept.push(key.clone());
                }
                None => warn!(key = key.as_str(), "Ignoring malformed reservation key"),
            }
        }

        ReservationFilter {
            filter: CategoryFilter::new(categories, negate),
            keys: kept,
        }
    }

    /// Reserves the category of `task` for `user_id`.
    ///
    /// Does nothing (returns false) unless reservations are enabled, the
    /// project uses the task-queue scheduler, and the task has a value for
    /// every configured reservation field.
    pub async fn acquire_reserve_task_lock(
        &self,
        settings: &ProjectSettings,
        task: &Task,
        user_id: i64,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        if !self.enabled()
            || settings.scheduler_kind() != SchedulerKind::TaskQueue
            || settings.reserve_category.is_empty()
        {
            return Ok(false);
        }

        let Some(category) = Category::from_task_info(&settings.reserve_category, &task.info) else {
            debug!(task_id = task.id, "Task has no complete category, not reserving");
            self.metrics.record_reservation("skipped");
            return Ok(false);
        };

        let key = self.ctx.keys.reservation_key(&ReservationKey {
            project_id: task.project_id,
            category: category.encode(),
            user_id,
            task_id: task.id,
        });
        let acquired = self
            .ctx
            .lock_manager(timeout)
            .acquire_reserve_task_lock(&key, self.ctx.config.reservation_grace)
            .await?;

        if acquired {
            self.metrics.record_reservation("acquired");
            debug!(
                project_id = task.project_id,
                task_id = task.id,
                user_id,
                category = category.encode().as_str(),
                "Category reserved"
            );
        }
        Ok(acquired)
    }

    /// Releases a user's reservations in a project.
    ///
    /// With `release_all_task` every reservation of the user is released
    /// except those backing a task the user still holds a lock on (other
    /// than `task_id`). Otherwise only reservations on `task_id` are
    /// released. Released keys lapse after `expiry`.
    #[allow(clippy::too_many_arguments)]
    pub async fn release_reserve_task_lock_by_id(
        &self,
        project_id: i64,
        task_id: Option<i64>,
        user_id: i64,
        timeout: Duration,
        reserve_fields: &[String],
        release_all_task: bool,
        expiry: Duration,
    ) -> Result<Vec<String>, StoreError> {
        if reserve_fields.is_empty() || (!release_all_task && task_id.is_none()) {
            return Ok(Vec::new());
        }

        let locks = self.ctx.lock_manager(timeout);
        let pattern = Category::wildcard(reserve_fields);
        let scope = if release_all_task { None } else { task_id };
        let mut keys = locks
            .get_task_category_lock(project_id, Some(user_id), Some(&pattern), false, scope)
            .await?;

        if release_all_task {
            let held = self.held_task_ids(user_id, timeout).await?;
            keys.retain(|key| {
                self.ctx.keys.parse_reservation_key(key).is_some_and(|parsed| {
                    Some(parsed.task_id) == task_id || !held.contains(&parsed.task_id)
                })
            });
        }

        self.release_reserve_task_lock_by_keys(&keys, timeout, expiry)
            .await?;
        Ok(keys)
    }

    /// Releases the given reservation keys; they lapse after `expiry`.
    ///
    /// Returns how many keys still existed.
    pub async fn release_reserve_task_lock_by_keys(
        &self,
        keys: &[String],
        timeout: Duration,
        expiry: Duration,
    ) -> Result<usize, StoreError> {
        let locks = self.ctx.lock_manager(timeout);
        let mut released = 0;
        for key in keys {
            if locks.release_reserve_task_lock(key, expiry).await? {
                released += 1;
                self.metrics.record_reservation("released");
            }
        }
        debug!(released, requested = keys.len(), "Reservations released");
        Ok(released)
    }

    /// Tasks the user currently holds an unexpired lock on.
    async fn held_task_ids(&self, user_id: i64, timeout: Duration) -> Result<HashSet<i64>, StoreError> {
        let locks = self.ctx.lock_manager(timeout);
        let now = self.ctx.now();
        let held = locks
            .get_locks(&self.ctx.keys.user_tasks_key(&user_id.to_string()))
            .await?
            .into_iter()
            .filter(|(_, expiration)| *expiration > now)
            .filter_map(|(task, _)| task.parse().ok())
            .collect();
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::clock::ManualClock;
    use crate::config::SchedulerConfig;
    use crate::kv::MemoryStore;
    use crate::store::{Project, TaskState};

    const TIMEOUT: Duration = Duration::from_secs(600);

    fn service(clock: Arc<ManualClock>) -> (LockContext, ReservationService) {
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let ctx = LockContext::new(store, clock, SchedulerConfig::default().with_key_prefix("t"));
        (ctx.clone(), ReservationService::new(ctx))
    }

    fn queue_project() -> Project {
        Project::new(
            1,
            json!({"sched": "task_queue_scheduler", "reserve_tasks": {"category": ["subject", "score"]}}),
        )
    }

    fn task(id: i64, subject: &str, score: i64) -> Task {
        Task {
            id,
            project_id: 1,
            state: TaskState::Ongoing,
            n_answers: 1,
            calibration: false,
            priority_0: 0.0,
            info: json!({"subject": subject, "score": score}),
            worker_filter: None,
            worker_pref: None,
            user_pref: None,
        }
    }

    fn fields() -> Vec<String> {
        vec!["subject".to_string(), "score".to_string()]
    }

    #[tokio::test]
    async fn test_acquire_and_find_own_reservation() {
        let clock = Arc::new(ManualClock::default());
        let (_, reservations) = service(clock);
        let project = queue_project();

        assert!(reservations
            .acquire_reserve_task_lock(&project.settings, &task(10, "math", 47), 5, TIMEOUT)
            .await
            .unwrap());

        let own = reservations
            .get_reserve_task_category_info(&fields(), 1, TIMEOUT, Some(5), false)
            .await
            .unwrap();
        assert_eq!(own.keys.len(), 1);
        assert_eq!(
            own.sql(),
            " AND ((task.info->>'score' = '47' AND task.info->>'subject' = 'math'))"
        );

        let others = reservations
            .get_reserve_task_category_info(&fields(), 1, TIMEOUT, Some(6), false)
            .await
            .unwrap();
        assert!(others.is_empty());
    }

    #[tokio::test]
    async fn test_exclude_user_negates_other_reservations() {
        let clock = Arc::new(ManualClock::default());
        let (_, reservations) = service(clock);
        let project = queue_project();

        reservations
            .acquire_reserve_task_lock(&project.settings, &task(10, "math", 47), 5, TIMEOUT)
            .await
            .unwrap();
        reservations
            .acquire_reserve_task_lock(&project.settings, &task(11, "art", 12), 6, TIMEOUT)
            .await
            .unwrap();

        let info = reservations
            .get_reserve_task_category_info(&fields(), 1, TIMEOUT, Some(5), true)
            .await
            .unwrap();
        assert_eq!(info.keys.len(), 1);
        assert!(info.filter.negate);
        assert!(!info.filter.matches(&json!({"subject": "art", "score": 12})));
        assert!(info.filter.matches(&json!({"subject": "math", "score": 47})));
    }

    #[tokio::test]
    async fn test_acquire_is_noop_for_other_schedulers_and_incomplete_tasks() {
        let clock = Arc::new(ManualClock::default());
        let (_, reservations) = service(clock);

        let locked = Project::new(1, json!({"sched": "locked_scheduler", "reserve_tasks": {"category": ["subject"]}}));
        assert!(!reservations
            .acquire_reserve_task_lock(&locked.settings, &task(1, "math", 1), 5, TIMEOUT)
            .await
            .unwrap());

        let project = queue_project();
        let mut incomplete = task(2, "math", 1);
        incomplete.info = json!({"subject": "math"});
        assert!(!reservations
            .acquire_reserve_task_lock(&project.settings, &incomplete, 5, TIMEOUT)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_disabled_deployment_returns_empty() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let ctx = LockContext::new(store, clock, SchedulerConfig::default().with_reservations(false));
        let reservations = ReservationService::new(ctx);

        assert!(!reservations
            .acquire_reserve_task_lock(&queue_project().settings, &task(1, "math", 1), 5, TIMEOUT)
            .await
            .unwrap());
        assert!(reservations
            .get_reserve_task_category_info(&fields(), 1, TIMEOUT, Some(5), false)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_release_all_keeps_reservations_of_held_tasks() {
        let clock = Arc::new(ManualClock::default());
        let (ctx, reservations) = service(clock.clone());
        let project = queue_project();

        for (id, subject) in [(10, "math"), (11, "math"), (12, "art")] {
            reservations
                .acquire_reserve_task_lock(&project.settings, &task(id, subject, 1), 5, TIMEOUT)
                .await
                .unwrap();
        }

        // User 5 still holds task 11 in another session
        ctx.lock_manager(TIMEOUT)
            .acquire_lock(&ctx.keys.user_tasks_key("5"), "11", None)
            .await
            .unwrap();

        let released = reservations
            .release_reserve_task_lock_by_id(1, Some(10), 5, TIMEOUT, &fields(), true, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(released.len(), 2);
        assert!(released.iter().all(|k| !k.ends_with(":task:11")));

        clock.advance(6.0);
        let remaining = reservations
            .get_reserve_task_category_info(&fields(), 1, TIMEOUT, Some(5), false)
            .await
            .unwrap();
        assert_eq!(remaining.keys.len(), 1);
        assert!(remaining.keys[0].ends_with(":task:11"));
    }

    #[tokio::test]
    async fn test_release_single_task() {
        let clock = Arc::new(ManualClock::default());
        let (_, reservations) = service(clock.clone());
        let project = queue_project();

        reservations
            .acquire_reserve_task_lock(&project.settings, &task(10, "math", 1), 5, TIMEOUT)
            .await
            .unwrap();
        reservations
            .acquire_reserve_task_lock(&project.settings, &task(11, "art", 1), 5, TIMEOUT)
            .await
            .unwrap();

        let released = reservations
            .release_reserve_task_lock_by_id(1, Some(10), 5, TIMEOUT, &fields(), false, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(released.len(), 1);

        clock.advance(6.0);
        let remaining = reservations
            .get_reserve_task_category_info(&fields(), 1, TIMEOUT, Some(5), false)
            .await
            .unwrap();
        assert_eq!(remaining.keys.len(), 1);
        assert!(remaining.keys[0].ends_with(":task:11"));
    }

    #[test]
    fn test_sql_filters_skip_foreign_and_malformed_keys() {
        let clock = Arc::new(ManualClock::default());
        let (ctx, reservations) = service(clock);
        let keys = vec![
            ctx.keys.reservation_key(&ReservationKey {
                project_id: 1,
                category: "subject:math".to_string(),
                user_id: 1,
                task_id: 1,
            }),
            ctx.keys.reservation_key(&ReservationKey {
                project_id: 2,
                category: "subject:art".to_string(),
                user_id: 1,
                task_id: 2,
            }),
            "t:reserve_task:project:1:category:odd:user:1:task:3".to_string(),
        ];

        let result = reservations.reserve_task_sql_filters(1, &keys, false);
        assert_eq!(result.keys, vec![keys[0].clone()]);
        assert_eq!(result.sql(), " AND ((task.info->>'subject' = 'math'))");
    }
}
