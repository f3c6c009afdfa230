//! In-process task, project and user store.
//!
//! Evaluates candidate queries with the same eligibility and ordering rules
//! as the generated SQL, including the reservation filter. Shuffling within
//! a priority uses a seedable RNG so runs can be reproduced.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::types::{CandidateQuery, CandidateRow, OrderColumn, Project, Task, TaskState};
use super::{ProjectStore, TaskStore, UserStore};
use crate::error::RepositoryError;
use crate::identity::Requester;
use crate::sched::{GoldMode, UserProfile};

#[derive(Debug, Clone)]
struct TaskRun {
    task_id: i64,
    requester: Requester,
}

#[derive(Debug, Default)]
struct Inner {
    projects: HashMap<i64, Project>,
    tasks: BTreeMap<i64, Task>,
    task_runs: Vec<TaskRun>,
    users: HashMap<i64, UserProfile>,
}

impl Inner {
    fn run_count(&self, task_id: i64) -> i64 {
        self.task_runs.iter().filter(|r| r.task_id == task_id).count() as i64
    }

    fn answered_by(&self, task_id: i64, requester: &Requester) -> bool {
        self.task_runs
            .iter()
            .filter(|r| r.task_id == task_id)
            .any(|r| same_contributor(&r.requester, requester))
    }

    fn is_candidate(&self, task: &Task, query: &CandidateQuery) -> bool {
        if task.project_id != query.project_id || task.state == TaskState::Completed {
            return false;
        }
        if !task.calibration && self.run_count(task.id) >= task.n_answers {
            return false;
        }
        if self.answered_by(task.id, &query.requester) {
            return false;
        }
        let gold_ok = if task.calibration {
            query.gold.allows_gold()
        } else {
            query.gold.allows_regular()
        };
        gold_ok && query.reservation.matches(&task.info)
    }
}

/// Matches task runs the way the SQL exclusion does: by the first
/// identifier the requester carries.
fn same_contributor(run: &Requester, requester: &Requester) -> bool {
    if let Some(user_id) = requester.user_id {
        return run.user_id == Some(user_id);
    }
    if let Some(uid) = requester.external_uid.as_deref().filter(|u| !u.is_empty()) {
        return run.external_uid.as_deref() == Some(uid);
    }
    match requester.user_ip.as_deref().filter(|ip| !ip.is_empty()) {
        Some(ip) => run.user_ip.as_deref() == Some(ip),
        None => false,
    }
}

/// In-memory implementation of the relational collaborators.
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
    rng: Mutex<ChaCha8Rng>,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            rng: Mutex::new(ChaCha8Rng::from_rng(&mut rand::rng())),
        }
    }

    /// Uses a fixed seed for shuffling within a priority.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            ..self
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_project(&self, project: Project) {
        self.inner().projects.insert(project.id, project);
    }

    pub fn add_task(&self, task: Task) {
        self.inner().tasks.insert(task.id, task);
    }

    /// Records a submitted answer.
    pub fn add_task_run(&self, task_id: i64, requester: &Requester) {
        self.inner().task_runs.push(TaskRun {
            task_id,
            requester: requester.clone(),
        });
    }

    pub fn set_task_state(&self, task_id: i64, state: TaskState) {
        if let Some(task) = self.inner().tasks.get_mut(&task_id) {
            task.state = state;
        }
    }

    pub fn set_user_profile(&self, user_id: i64, profile: UserProfile) {
        self.inner().users.insert(user_id, profile);
    }

    fn order(query: &CandidateQuery, pinned: (bool, bool), a: &Task, b: &Task) -> Ordering {
        let by_pin = pinned.1.cmp(&pinned.0);
        let by_gold = match query.gold {
            GoldMode::GoldFirst => b.calibration.cmp(&a.calibration),
            GoldMode::GoldLast => a.calibration.cmp(&b.calibration),
            GoldMode::GoldOnly | GoldMode::NoGold => Ordering::Equal,
        };
        let by_column = match query.order.column {
            OrderColumn::Priority => OrderedFloat(a.priority_0).cmp(&OrderedFloat(b.priority_0)),
            OrderColumn::Id => a.id.cmp(&b.id),
        };
        let by_column = if query.order.desc {
            by_column.reverse()
        } else {
            by_column
        };
        by_pin.then(by_gold).then(by_column)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_task(&self, task_id: i64) -> Result<Option<Task>, RepositoryError> {
        Ok(self.inner().tasks.get(&task_id).cloned())
    }

    async fn get_task_by(
        &self,
        project_id: i64,
        task_id: i64,
    ) -> Result<Option<Task>, RepositoryError> {
        Ok(self
            .inner()
            .tasks
            .get(&task_id)
            .filter(|t| t.project_id == project_id)
            .cloned())
    }

    async fn count_task_runs(&self, task_id: i64) -> Result<i64, RepositoryError> {
        Ok(self.inner().run_count(task_id))
    }

    async fn get_candidate_tasks(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<CandidateRow>, RepositoryError> {
        let inner = self.inner();
        // Ascending id order is the tiebreak
        let mut tasks: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|t| inner.is_candidate(t, query))
            .collect();

        if query.rand_within_priority && query.order.column == OrderColumn::Priority {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            tasks.shuffle(&mut *rng);
        }

        tasks.sort_by(|a, b| {
            let pinned = (query.pinned.contains(&a.id), query.pinned.contains(&b.id));
            Self::order(query, pinned, a, b)
        });

        let timeout = inner
            .projects
            .get(&query.project_id)
            .and_then(|p| p.settings.timeout);

        Ok(tasks
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|task| CandidateRow {
                task_id: task.id,
                taskrun_count: inner.run_count(task.id),
                n_answers: task.n_answers,
                is_gold: task.calibration,
                worker_filter: task.worker_filter.clone(),
                worker_pref: task.worker_pref.clone(),
                user_pref: task.user_pref.clone(),
                timeout,
            })
            .collect())
    }

    async fn count_candidate_tasks(&self, query: &CandidateQuery) -> Result<usize, RepositoryError> {
        let inner = self.inner();
        Ok(inner
            .tasks
            .values()
            .filter(|t| inner.is_candidate(t, query))
            .count())
    }
}

#[async_trait]
impl ProjectStore for MemoryTaskStore {
    async fn get_project(&self, project_id: i64) -> Result<Option<Project>, RepositoryError> {
        Ok(self.inner().projects.get(&project_id).cloned())
    }
}

#[async_trait]
impl UserStore for MemoryTaskStore {
    async fn get_user_profile(&self, user_id: i64) -> Result<Option<UserProfile>, RepositoryError> {
        Ok(self.inner().users.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::reservation::{Category, CategoryFilter};
    use crate::store::TaskOrder;

    fn store() -> MemoryTaskStore {
        let store = MemoryTaskStore::new().with_seed(3);
        store.add_project(Project::new(1, json!({"timeout": 90})));
        store.add_task(Task::new(1, 1).with_priority(0.1));
        store.add_task(Task::new(2, 1).with_priority(0.9));
        store.add_task(Task::new(3, 1).with_priority(0.5).gold());
        store.add_task(Task::new(4, 1).with_priority(0.9).with_n_answers(2));
        store.add_task(Task::new(5, 2));
        store
    }

    fn ids(rows: &[CandidateRow]) -> Vec<i64> {
        rows.iter().map(|r| r.task_id).collect()
    }

    fn query(requester: Requester) -> CandidateQuery {
        let mut q = CandidateQuery::new(1, requester);
        q.limit = 10;
        q
    }

    #[tokio::test]
    async fn test_priority_then_id_with_gold_last() {
        let store = store();
        let rows = store.get_candidate_tasks(&query(Requester::user(1))).await.unwrap();
        assert_eq!(ids(&rows), vec![2, 4, 1, 3]);
        assert_eq!(rows[0].timeout, Some(90));
    }

    #[tokio::test]
    async fn test_gold_modes() {
        let store = store();
        let mut q = query(Requester::user(1));

        q.gold = GoldMode::GoldFirst;
        assert_eq!(ids(&store.get_candidate_tasks(&q).await.unwrap())[0], 3);

        q.gold = GoldMode::GoldOnly;
        assert_eq!(ids(&store.get_candidate_tasks(&q).await.unwrap()), vec![3]);

        q.gold = GoldMode::NoGold;
        assert_eq!(ids(&store.get_candidate_tasks(&q).await.unwrap()), vec![2, 4, 1]);
    }

    #[tokio::test]
    async fn test_answered_and_exhausted_tasks_are_excluded() {
        let store = store();
        let alice = Requester::user(1);
        store.add_task_run(2, &alice);
        store.add_task_run(4, &Requester::anonymous("10.0.0.1"));

        // Task 2 is exhausted for everyone; task 4 still has one slot
        let rows = store.get_candidate_tasks(&query(Requester::user(2))).await.unwrap();
        assert_eq!(ids(&rows), vec![4, 1, 3]);
        assert_eq!(rows[0].remaining_slots(), Some(1));

        let rows = store
            .get_candidate_tasks(&query(Requester::anonymous("10.0.0.1")))
            .await
            .unwrap();
        assert_eq!(ids(&rows), vec![1, 3]);

        // Gold tasks stay available after any number of runs
        store.add_task_run(3, &alice);
        store.add_task_run(3, &Requester::user(7));
        let rows = store.get_candidate_tasks(&query(Requester::user(2))).await.unwrap();
        assert!(ids(&rows).contains(&3));
    }

    #[tokio::test]
    async fn test_completed_tasks_are_excluded() {
        let store = store();
        store.set_task_state(2, TaskState::Completed);
        let count = store
            .count_candidate_tasks(&query(Requester::user(1)))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_limit_offset_and_pinned() {
        let store = store();
        let mut q = query(Requester::user(1));
        q.limit = 2;
        assert_eq!(ids(&store.get_candidate_tasks(&q).await.unwrap()), vec![2, 4]);

        q.pinned = vec![1];
        assert_eq!(ids(&store.get_candidate_tasks(&q).await.unwrap()), vec![1, 2]);

        q.pinned.clear();
        q.offset = 1;
        assert_eq!(ids(&store.get_candidate_tasks(&q).await.unwrap()), vec![4, 1]);
    }

    #[tokio::test]
    async fn test_order_by_id_ascending() {
        let store = store();
        let mut q = query(Requester::user(1));
        q.gold = GoldMode::NoGold;
        q.order = TaskOrder::parse(Some("id"), false).unwrap();
        assert_eq!(ids(&store.get_candidate_tasks(&q).await.unwrap()), vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_random_within_priority_keeps_priority_order() {
        let store = MemoryTaskStore::new().with_seed(11);
        for id in 1..=20 {
            let priority = if id <= 10 { 1.0 } else { 0.0 };
            store.add_task(Task::new(id, 1).with_priority(priority));
        }
        let mut q = query(Requester::user(1));
        q.limit = 20;
        q.rand_within_priority = true;

        let rows = ids(&store.get_candidate_tasks(&q).await.unwrap());
        let (high, low) = rows.split_at(10);
        assert!(high.iter().all(|id| *id <= 10));
        assert!(low.iter().all(|id| *id > 10));
    }

    #[tokio::test]
    async fn test_reservation_filter() {
        let store = MemoryTaskStore::new();
        store.add_task(Task::new(1, 1).with_info(json!({"subject": "math"})));
        store.add_task(Task::new(2, 1).with_info(json!({"subject": "art"})));
        store.add_task(Task::new(3, 1));

        let mut q = query(Requester::user(1));
        q.reservation = CategoryFilter::new(Category::parse("subject:math"), false);
        assert_eq!(ids(&store.get_candidate_tasks(&q).await.unwrap()), vec![1]);

        q.reservation.negate = true;
        assert_eq!(ids(&store.get_candidate_tasks(&q).await.unwrap()), vec![2, 3]);
    }
}
