//! The scheduling driver.
//!
//! [`Scheduler`] runs the stages shared by every policy and hands only the
//! ranking step to the project's [`TaskSelector`]:
//!
//! 1. resolve the policy and lock timeout
//! 2. direct task-id fast path
//! 3. already-locked fast path
//! 4. reservation filter (task-queue policy only)
//! 5. candidate fetch, falling back from the user's own categories to
//!    categories nobody reserved, and from there to any category
//! 6. ranking
//! 7. lock attempt loop
//!
//! Losing every lock race is not an error: the result is simply empty.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::gold::{GoldMode, SavedTaskPosition};
use super::policy::{RankContext, SchedulerKind};
use crate::error::{SchedulerError, StoreError};
use crate::identity::Requester;
use crate::locks::LockContext;
use crate::metrics::MetricsCollector;
use crate::partial::PartialAnswers;
use crate::registry::ActiveUserRegistry;
use crate::reservation::{ReservationFilter, ReservationService};
use crate::store::{
    CandidateQuery, Project, ProjectSettings, ProjectStore, Task, TaskOrder, TaskStore, UserStore,
};

/// Largest `offset` accepted by the scheduler.
pub const MAX_OFFSET: usize = 2;

/// Arguments of [`Scheduler::new_task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTaskRequest {
    pub project_id: i64,
    /// Scheduler name overriding the project's configured one.
    #[serde(default)]
    pub sched: Option<String>,
    #[serde(default)]
    pub requester: Requester,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Ordering column; unset means priority descending.
    #[serde(default)]
    pub orderby: Option<String>,
    #[serde(default)]
    pub desc: bool,
    #[serde(default)]
    pub rand_within_priority: bool,
    #[serde(default)]
    pub gold_only: bool,
    /// Task to resume directly, skipping selection.
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default)]
    pub saved_task_position: Option<SavedTaskPosition>,
}

fn default_limit() -> usize {
    1
}

impl NewTaskRequest {
    pub fn new(project_id: i64, requester: Requester) -> Self {
        Self {
            project_id,
            sched: None,
            requester,
            offset: 0,
            limit: default_limit(),
            orderby: None,
            desc: false,
            rand_within_priority: false,
            gold_only: false,
            task_id: None,
            saved_task_position: None,
        }
    }

    pub fn with_scheduler(mut self, sched: impl Into<String>) -> Self {
        self.sched = Some(sched.into());
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_order(mut self, orderby: impl Into<String>, desc: bool) -> Self {
        self.orderby = Some(orderby.into());
        self.desc = desc;
        self
    }

    pub fn with_rand_within_priority(mut self, enabled: bool) -> Self {
        self.rand_within_priority = enabled;
        self
    }

    pub fn with_gold_only(mut self, gold_only: bool) -> Self {
        self.gold_only = gold_only;
        self
    }

    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_saved_task_position(mut self, position: SavedTaskPosition) -> Self {
        self.saved_task_position = Some(position);
        self
    }

    fn order(&self) -> Result<TaskOrder, SchedulerError> {
        match self.orderby.as_deref() {
            None => Ok(TaskOrder::default()),
            Some(column) => TaskOrder::parse(Some(column), self.desc),
        }
    }
}

/// Task scheduler over the shared store and the relational collaborators.
pub struct Scheduler {
    ctx: LockContext,
    tasks: Arc<dyn TaskStore>,
    projects: Arc<dyn ProjectStore>,
    users: Arc<dyn UserStore>,
    reservations: ReservationService,
    registry: ActiveUserRegistry,
    partial: PartialAnswers,
    metrics: MetricsCollector,
    rng: Mutex<ChaCha8Rng>,
}

impl Scheduler {
    pub fn new(
        ctx: LockContext,
        tasks: Arc<dyn TaskStore>,
        projects: Arc<dyn ProjectStore>,
        users: Arc<dyn UserStore>,
    ) -> Self {
        Self {
            reservations: ReservationService::new(ctx.clone()),
            registry: ActiveUserRegistry::new(ctx.clone()),
            partial: PartialAnswers::new(ctx.clone()),
            metrics: MetricsCollector::new(),
            rng: Mutex::new(ChaCha8Rng::from_rng(&mut rand::rng())),
            ctx,
            tasks,
            projects,
            users,
        }
    }

    /// Builds a scheduler whose three collaborators are one store.
    pub fn from_store<S>(ctx: LockContext, store: Arc<S>) -> Self
    where
        S: TaskStore + ProjectStore + UserStore + 'static,
    {
        Self::new(ctx, store.clone(), store.clone(), store)
    }

    /// Seeds the RNG used for gold ordering.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn context(&self) -> &LockContext {
        &self.ctx
    }

    pub fn reservations(&self) -> &ReservationService {
        &self.reservations
    }

    pub fn registry(&self) -> &ActiveUserRegistry {
        &self.registry
    }

    pub fn partial_answers(&self) -> &PartialAnswers {
        &self.partial
    }

    // =========================================================================
    // Task selection
    // =========================================================================

    /// Picks and locks a task for the requester.
    ///
    /// Returns at most one task; an empty result means nothing could be
    /// locked right now.
    pub async fn new_task(&self, request: &NewTaskRequest) -> Result<Vec<Task>, SchedulerError> {
        let started = Instant::now();
        let project = self.load_project(request.project_id).await?;
        let kind = match request.sched.as_deref() {
            Some(name) => SchedulerKind::from_name(Some(name)),
            None => project.settings.scheduler_kind(),
        };
        let timeout = project.settings.timeout_or(self.ctx.config.default_timeout);

        let holder = request.requester.holder_id().ok_or_else(|| {
            SchedulerError::BadRequest("a user id, external uid or ip is required".to_string())
        })?;
        if request.offset > MAX_OFFSET {
            return Err(SchedulerError::BadRequest(format!(
                "offset {} is not supported, at most {} is allowed",
                request.offset, MAX_OFFSET
            )));
        }
        let order = request.order()?;
        if request.offset > 0 || request.limit == 0 {
            return Ok(Vec::new());
        }

        if let Some(task_id) = request.task_id {
            let task = self.direct_task(&project, task_id, &holder, timeout).await?;
            let label = task.as_ref().map(|_| "direct");
            self.metrics
                .record_selection(kind.as_str(), label, started.elapsed().as_secs_f64());
            return Ok(task.into_iter().collect());
        }

        if let Some(task) = self.existing_lock(&project, &holder).await? {
            debug!(
                project_id = project.id,
                holder = holder.as_str(),
                task_id = task.id,
                "Returning already locked task"
            );
            self.metrics.record_selection(
                kind.as_str(),
                Some("existing"),
                started.elapsed().as_secs_f64(),
            );
            return Ok(vec![task]);
        }

        let task = self
            .select_and_lock(&project, kind, request, &holder, order, timeout)
            .await?;
        let label = task.as_ref().map(|_| "new");
        self.metrics
            .record_selection(kind.as_str(), label, started.elapsed().as_secs_f64());
        if task.is_none() {
            debug!(
                project_id = project.id,
                holder = holder.as_str(),
                scheduler = kind.as_str(),
                "No task available"
            );
        }
        Ok(task.into_iter().collect())
    }

    /// Returns a named task without ranking, taking a lock if a slot is free.
    async fn direct_task(
        &self,
        project: &Project,
        task_id: i64,
        holder: &str,
        timeout: Duration,
    ) -> Result<Option<Task>, SchedulerError> {
        let Some(task) = self.tasks.get_task_by(project.id, task_id).await? else {
            return Ok(None);
        };

        let limit = self.remaining_slots(&task).await?;
        if self.acquire_locks(task.id, holder, limit, timeout).await? {
            self.after_lock(project, &task, holder, timeout).await?;
        }
        Ok(Some(task))
    }

    /// Task the holder already has locked with enough time left.
    async fn existing_lock(
        &self,
        project: &Project,
        holder: &str,
    ) -> Result<Option<Task>, SchedulerError> {
        let Some((task_id, remaining)) = self
            .get_task_id_and_duration_for_project_user(project.id, holder)
            .await?
        else {
            return Ok(None);
        };
        if remaining <= self.ctx.config.min_remaining_lock.as_secs_f64() {
            return Ok(None);
        }
        Ok(self.tasks.get_task_by(project.id, task_id).await?)
    }

    async fn select_and_lock(
        &self,
        project: &Project,
        kind: SchedulerKind,
        request: &NewTaskRequest,
        holder: &str,
        order: TaskOrder,
        timeout: Duration,
    ) -> Result<Option<Task>, SchedulerError> {
        let selector = kind.selector();
        let settings = &project.settings;
        let user_id = request.requester.user_id;

        let gold = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            GoldMode::select(request.gold_only, settings, &mut *rng)
        };

        let reserving = selector.uses_reservations() && !settings.reserve_category.is_empty();
        let (mut reservation, mut excluded) = if reserving {
            self.reservation_filter(settings, project.id, timeout, user_id)
                .await?
        } else {
            (ReservationFilter::default(), false)
        };

        let active = self.registry.get_active_user_count(project.id).await?;
        let mut batch = selector.batch_size(active, &self.ctx.config);

        let mut rank_ctx = RankContext {
            saved_position: request.saved_task_position,
            ..Default::default()
        };
        if request.saved_task_position.is_some() {
            batch += self.ctx.config.max_saved_answers;
            rank_ctx.saved = self.partial.saved_tasks(project.id, holder).await?;
        }
        if selector.needs_profile() {
            if let Some(user_id) = user_id {
                rank_ctx.profile = self.users.get_user_profile(user_id).await?;
            }
        }

        let mut query = CandidateQuery::new(project.id, request.requester.clone());
        query.reservation = reservation.filter.clone();
        query.gold = gold;
        query.order = order;
        query.rand_within_priority = request.rand_within_priority;
        query.limit = batch;
        query.pinned = rank_ctx.saved.keys().copied().collect();

        let mut candidates = self.tasks.get_candidate_tasks(&query).await?;

        if candidates.is_empty() && reserving && !excluded && !reservation.is_empty() {
            // The user's reserved categories ran dry
            if let Some(user_id) = user_id {
                let released = self
                    .reservations
                    .release_reserve_task_lock_by_id(
                        project.id,
                        None,
                        user_id,
                        timeout,
                        &settings.reserve_category,
                        true,
                        self.ctx.config.release_delay,
                    )
                    .await?;
                debug!(
                    project_id = project.id,
                    user_id,
                    released = released.len(),
                    "Reserved categories exhausted, retrying without them"
                );
                reservation = self
                    .reservations
                    .get_reserve_task_category_info(
                        &settings.reserve_category,
                        project.id,
                        timeout,
                        Some(user_id),
                        true,
                    )
                    .await?;
                excluded = true;
                query.reservation = reservation.filter.clone();
                candidates = self.tasks.get_candidate_tasks(&query).await?;
            }
        }

        if candidates.is_empty() && reserving && excluded && !reservation.is_empty() {
            // Only categories reserved by others are left; share them
            debug!(
                project_id = project.id,
                holder,
                "Only reserved categories left, retrying without reservations"
            );
            query.reservation = Default::default();
            candidates = self.tasks.get_candidate_tasks(&query).await?;
        }

        debug!(
            project_id = project.id,
            holder,
            scheduler = kind.as_str(),
            gold = gold.as_str(),
            batch,
            excluded,
            fetched = candidates.len(),
            "Candidates fetched"
        );

        for row in selector.rank(candidates, &rank_ctx) {
            let limit = row.remaining_slots();
            if limit == Some(0) {
                continue;
            }
            let row_timeout = row.timeout.map(Duration::from_secs).unwrap_or(timeout);
            if !self.acquire_locks(row.task_id, holder, limit, row_timeout).await? {
                continue;
            }

            let Some(task) = self.tasks.get_task(row.task_id).await? else {
                warn!(task_id = row.task_id, "Locked task vanished, releasing");
                self.release_pair(row.task_id, holder, row_timeout).await?;
                continue;
            };

            self.after_lock(project, &task, holder, row_timeout).await?;
            info!(
                project_id = project.id,
                task_id = task.id,
                holder,
                scheduler = kind.as_str(),
                "Task locked for user"
            );
            return Ok(Some(task));
        }

        Ok(None)
    }

    /// The user's own reservations, or everyone else's when they hold none.
    ///
    /// The flag is true when the returned filter excludes other users' categories.
    async fn reservation_filter(
        &self,
        settings: &ProjectSettings,
        project_id: i64,
        timeout: Duration,
        user_id: Option<i64>,
    ) -> Result<(ReservationFilter, bool), StoreError> {
        let own = self
            .reservations
            .get_reserve_task_category_info(
                &settings.reserve_category,
                project_id,
                timeout,
                user_id,
                false,
            )
            .await?;
        if !own.is_empty() {
            return Ok((own, false));
        }

        let others = self
            .reservations
            .get_reserve_task_category_info(
                &settings.reserve_category,
                project_id,
                timeout,
                user_id,
                true,
            )
            .await?;
        Ok((others, true))
    }

    /// Bookkeeping after a successful lock: reservation, reverse index, registry.
    async fn after_lock(
        &self,
        project: &Project,
        task: &Task,
        holder: &str,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        if let Ok(user_id) = holder.parse::<i64>() {
            if let Err(e) = self
                .reservations
                .acquire_reserve_task_lock(&project.settings, task, user_id, timeout)
                .await
            {
                warn!(task_id = task.id, user_id, error = %e, "Failed to reserve task category");
            }
        }

        self.set_task_id_project_id(task.id, project.id, timeout)
            .await?;
        self.registry
            .register_active_user(project.id, holder, timeout)
            .await
    }

    async fn remaining_slots(&self, task: &Task) -> Result<Option<usize>, SchedulerError> {
        if task.is_gold() {
            return Ok(None);
        }
        let runs = self.tasks.count_task_runs(task.id).await?;
        Ok(Some((task.n_answers - runs).max(0) as usize))
    }

    async fn load_project(&self, project_id: i64) -> Result<Project, SchedulerError> {
        self.projects
            .get_project(project_id)
            .await?
            .ok_or(SchedulerError::ProjectNotFound(project_id))
    }

    // =========================================================================
    // Locking protocol
    // =========================================================================

    /// Locks `task_id` for `holder` if a redundancy slot is free.
    ///
    /// `limit = None` means unbounded (gold tasks). On success the
    /// user-side index is updated as best-effort bookkeeping.
    pub async fn acquire_locks(
        &self,
        task_id: i64,
        holder: &str,
        limit: Option<usize>,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        let locks = self.ctx.lock_manager(timeout);
        let outcome = locks
            .try_acquire(&self.ctx.keys.task_users_key(task_id), holder, limit)
            .await?;
        self.metrics.record_lock_attempt(outcome.as_str());
        if !outcome.is_held() {
            return Ok(false);
        }

        let user_key = self.ctx.keys.user_tasks_key(holder);
        if let Err(e) = locks
            .acquire_lock(&user_key, &task_id.to_string(), None)
            .await
        {
            warn!(task_id, holder, error = %e, "Failed to record task in user index");
        }
        Ok(true)
    }

    async fn release_pair(
        &self,
        task_id: i64,
        holder: &str,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        let locks = self.ctx.lock_manager(timeout);
        locks
            .release_lock(&self.ctx.keys.task_users_key(task_id), holder)
            .await?;
        locks
            .release_lock(&self.ctx.keys.user_tasks_key(holder), &task_id.to_string())
            .await?;
        self.metrics.record_lock_released();
        Ok(())
    }

    /// Releases the requester's lock on a task, typically on submission.
    ///
    /// The task's category reservation is shortened to the reservation
    /// grace period, and the requester stops being an active user of the
    /// project once no other lock there remains.
    pub async fn release_lock(
        &self,
        task_id: i64,
        requester: &Requester,
        timeout: Duration,
    ) -> Result<(), SchedulerError> {
        let holder = requester
            .holder_id()
            .ok_or_else(|| SchedulerError::BadRequest("cannot release without an identity".to_string()))?;
        self.release_pair(task_id, &holder, timeout).await?;

        let Some(project_id) = self.get_task_id_project_id(task_id).await? else {
            debug!(task_id, "Released lock on unknown task");
            return Ok(());
        };

        if let Some(user_id) = requester.user_id {
            if let Some(project) = self.projects.get_project(project_id).await? {
                self.reservations
                    .release_reserve_task_lock_by_id(
                        project_id,
                        Some(task_id),
                        user_id,
                        timeout,
                        &project.settings.reserve_category,
                        false,
                        self.ctx.config.reservation_grace,
                    )
                    .await?;
            }
        }

        let others = self.project_locks(&holder, project_id, timeout).await?;
        if others.iter().all(|other| *other == task_id) {
            self.registry
                .unregister_active_user(project_id, &holder)
                .await?;
        }
        debug!(task_id, project_id, holder = holder.as_str(), "Lock released");
        Ok(())
    }

    /// Releases every lock the requester holds in a project.
    ///
    /// Returns the released task ids.
    pub async fn release_user_locks_for_project(
        &self,
        requester: &Requester,
        project_id: i64,
    ) -> Result<Vec<i64>, SchedulerError> {
        let holder = requester
            .holder_id()
            .ok_or_else(|| SchedulerError::BadRequest("cannot release without an identity".to_string()))?;
        let project = self.load_project(project_id).await?;
        let timeout = project.settings.timeout_or(self.ctx.config.default_timeout);

        let task_ids = self.project_locks(&holder, project_id, timeout).await?;
        for task_id in &task_ids {
            self.release_pair(*task_id, &holder, timeout).await?;
        }

        if let Some(user_id) = requester.user_id {
            self.reservations
                .release_reserve_task_lock_by_id(
                    project_id,
                    None,
                    user_id,
                    timeout,
                    &project.settings.reserve_category,
                    true,
                    self.ctx.config.release_delay,
                )
                .await?;
        }
        self.registry
            .unregister_active_user(project_id, &holder)
            .await?;

        info!(
            project_id,
            holder = holder.as_str(),
            released = task_ids.len(),
            "Released user locks for project"
        );
        Ok(task_ids)
    }

    /// Lock timeout and remaining lock time of the requester on a task.
    ///
    /// The remaining time is `None` when the requester holds no live lock.
    pub async fn fetch_lock_for_user(
        &self,
        project_id: i64,
        task_id: i64,
        requester: &Requester,
    ) -> Result<(Duration, Option<f64>), SchedulerError> {
        let project = self.load_project(project_id).await?;
        let timeout = project.settings.timeout_or(self.ctx.config.default_timeout);
        let Some(holder) = requester.holder_id() else {
            return Ok((timeout, None));
        };

        let locks = self.ctx.lock_manager(timeout);
        let remaining = locks
            .get_locks(&self.ctx.keys.task_users_key(task_id))
            .await?
            .get(&holder)
            .map(|expiration| locks.seconds_remaining(*expiration))
            .filter(|remaining| *remaining > 0.0);
        Ok((timeout, remaining))
    }

    /// Scheduler and lock timeout of a project.
    pub fn get_scheduler_and_timeout(&self, project: &Project) -> (SchedulerKind, Duration) {
        (
            project.settings.scheduler_kind(),
            project.settings.timeout_or(self.ctx.config.default_timeout),
        )
    }

    /// Like [`Scheduler::get_scheduler_and_timeout`], loading the project first.
    pub async fn get_project_scheduler_and_timeout(
        &self,
        project_id: i64,
    ) -> Result<(SchedulerKind, Duration), SchedulerError> {
        let project = self.load_project(project_id).await?;
        Ok(self.get_scheduler_and_timeout(&project))
    }

    /// Task in the project the holder has locked longest, with its remaining seconds.
    pub async fn get_task_id_and_duration_for_project_user(
        &self,
        project_id: i64,
        holder: &str,
    ) -> Result<Option<(i64, f64)>, SchedulerError> {
        let locks = self.ctx.lock_manager(self.ctx.config.default_timeout);
        let held: Vec<(i64, f64)> = locks
            .get_locks(&self.ctx.keys.user_tasks_key(holder))
            .await?
            .into_iter()
            .filter_map(|(task, expiration)| Some((task.parse().ok()?, expiration)))
            .filter(|(_, expiration)| locks.seconds_remaining(*expiration) > 0.0)
            .collect();
        if held.is_empty() {
            return Ok(None);
        }

        let task_ids: Vec<i64> = held.iter().map(|(task_id, _)| *task_id).collect();
        let projects = self.get_task_ids_project_id(&task_ids).await?;
        let best = held
            .into_iter()
            .zip(projects)
            .filter(|(_, project)| *project == Some(project_id))
            .map(|((task_id, expiration), _)| (task_id, locks.seconds_remaining(expiration)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        Ok(best)
    }

    /// Live task locks of the holder that belong to the project.
    async fn project_locks(
        &self,
        holder: &str,
        project_id: i64,
        timeout: Duration,
    ) -> Result<Vec<i64>, SchedulerError> {
        let locks = self.ctx.lock_manager(timeout);
        let now = self.ctx.now();
        let mut task_ids: Vec<i64> = locks
            .get_locks(&self.ctx.keys.user_tasks_key(holder))
            .await?
            .into_iter()
            .filter(|(_, expiration)| *expiration > now)
            .filter_map(|(task, _)| task.parse().ok())
            .collect();
        task_ids.sort_unstable();

        let projects = self.get_task_ids_project_id(&task_ids).await?;
        Ok(task_ids
            .into_iter()
            .zip(projects)
            .filter(|(_, project)| *project == Some(project_id))
            .map(|(task_id, _)| task_id)
            .collect())
    }

    // =========================================================================
    // Availability
    // =========================================================================

    /// Number of tasks the requester could still be given in the project.
    ///
    /// Counts unanswered, incomplete tasks with open slots, narrowed by the
    /// same reservation filter the task-queue scheduler applies.
    pub async fn n_available_tasks_for_user(
        &self,
        project_id: i64,
        requester: &Requester,
    ) -> Result<usize, SchedulerError> {
        if requester.is_unidentified() {
            return Err(SchedulerError::BadRequest(
                "a user id, external uid or ip is required".to_string(),
            ));
        }
        let project = self.load_project(project_id).await?;
        let settings = &project.settings;
        let timeout = settings.timeout_or(self.ctx.config.default_timeout);

        let mut query = CandidateQuery::new(project_id, requester.clone());
        if settings.scheduler_kind().selector().uses_reservations()
            && !settings.reserve_category.is_empty()
        {
            let (reservation, _) = self
                .reservation_filter(settings, project_id, timeout, requester.user_id)
                .await?;
            query.reservation = reservation.filter;
        }
        Ok(self.tasks.count_candidate_tasks(&query).await?)
    }

    // =========================================================================
    // Task -> project index
    // =========================================================================

    /// Caches the project of a task for twice the lock timeout.
    pub async fn set_task_id_project_id(
        &self,
        task_id: i64,
        project_id: i64,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        self.ctx
            .store
            .set(
                &self.ctx.keys.task_project_key(task_id),
                &project_id.to_string(),
                Some(timeout * 2),
            )
            .await
    }

    /// Project of a task, repaired from the task store on a cache miss.
    pub async fn get_task_id_project_id(&self, task_id: i64) -> Result<Option<i64>, SchedulerError> {
        let mut projects = self.get_task_ids_project_id(&[task_id]).await?;
        Ok(projects.pop().flatten())
    }

    /// Projects of many tasks with one multi-get; misses are repaired.
    ///
    /// A repaired entry lives for twice the owning project's lock timeout.
    /// Task store failures propagate.
    pub async fn get_task_ids_project_id(
        &self,
        task_ids: &[i64],
    ) -> Result<Vec<Option<i64>>, SchedulerError> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = task_ids
            .iter()
            .map(|task_id| self.ctx.keys.task_project_key(*task_id))
            .collect();
        let cached = self.ctx.store.mget(&keys).await?;

        let mut projects = Vec::with_capacity(task_ids.len());
        let mut repaired: HashMap<i64, Option<i64>> = HashMap::new();
        for (task_id, value) in task_ids.iter().zip(cached) {
            if let Some(project_id) = value.and_then(|v| v.parse::<i64>().ok()) {
                projects.push(Some(project_id));
                continue;
            }

            if let Some(project_id) = repaired.get(task_id) {
                projects.push(*project_id);
                continue;
            }
            let project_id = self.tasks.get_task(*task_id).await?.map(|t| t.project_id);
            if let Some(project_id) = project_id {
                let timeout = match self.projects.get_project(project_id).await? {
                    Some(project) => project.settings.timeout_or(self.ctx.config.default_timeout),
                    None => self.ctx.config.default_timeout,
                };
                debug!(task_id, project_id, "Repaired task project index");
                self.set_task_id_project_id(*task_id, project_id, timeout)
                    .await?;
            }
            repaired.insert(*task_id, project_id);
            projects.push(project_id);
        }
        Ok(projects)
    }
}
