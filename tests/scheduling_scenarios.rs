//! End-to-end scheduling scenarios over the in-memory stores.
//!
//! Run with: cargo test --test scheduling_scenarios

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crowd_sched::clock::ManualClock;
use crowd_sched::config::SchedulerConfig;
use crowd_sched::identity::Requester;
use crowd_sched::kv::MemoryStore;
use crowd_sched::locks::{LockContext, ReservationKey};
use crowd_sched::reservation::Category;
use crowd_sched::sched::{NewTaskRequest, SavedTaskPosition, Scheduler, UserProfile};
use crowd_sched::store::{MemoryTaskStore, Project, Task};

const TIMEOUT: Duration = Duration::from_secs(3600);

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryTaskStore>,
    scheduler: Arc<Scheduler>,
}

impl Harness {
    fn new(project_info: Value) -> Self {
        let clock = Arc::new(ManualClock::default());
        let kv = Arc::new(MemoryStore::new(clock.clone()));
        let ctx = LockContext::new(kv, clock.clone(), SchedulerConfig::default());
        let store = Arc::new(MemoryTaskStore::new().with_seed(7));
        store.add_project(Project::new(1, project_info));
        let scheduler = Arc::new(Scheduler::from_store(ctx, store.clone()).with_seed(7));
        Self {
            clock,
            store,
            scheduler,
        }
    }

    async fn next(&self, user_id: i64) -> Option<i64> {
        let tasks = self
            .scheduler
            .new_task(&NewTaskRequest::new(1, Requester::user(user_id)))
            .await
            .expect("new_task should succeed");
        assert!(tasks.len() <= 1);
        tasks.first().map(|t| t.id)
    }

    async fn submit(&self, task_id: i64, user_id: i64) {
        let user = Requester::user(user_id);
        self.store.add_task_run(task_id, &user);
        self.scheduler
            .release_lock(task_id, &user, TIMEOUT)
            .await
            .expect("release should succeed");
    }

    async fn live_holders(&self, task_id: i64) -> usize {
        let ctx = self.scheduler.context();
        let now = ctx.now();
        ctx.lock_manager(TIMEOUT)
            .get_locks(&ctx.keys.task_users_key(task_id))
            .await
            .unwrap()
            .values()
            .filter(|expiration| **expiration > now)
            .count()
    }

    async fn active_users(&self) -> usize {
        self.scheduler
            .registry()
            .get_active_user_count(1)
            .await
            .unwrap()
    }

    /// Writes a reservation key as if `user_id` had locked `task_id`.
    async fn reserve(&self, user_id: i64, task_id: i64, pairs: &[(&str, &str)]) {
        let ctx = self.scheduler.context();
        let category = Category::new(pairs.iter().copied()).expect("valid category");
        let key = ctx.keys.reservation_key(&ReservationKey {
            project_id: 1,
            category: category.encode(),
            user_id,
            task_id,
        });
        ctx.lock_manager(TIMEOUT)
            .acquire_reserve_task_lock(&key, ctx.config.reservation_grace)
            .await
            .unwrap();
    }

    async fn reservations_of(&self, user_id: i64) -> Vec<String> {
        let ctx = self.scheduler.context();
        let mut keys = ctx
            .lock_manager(TIMEOUT)
            .get_task_category_lock(1, Some(user_id), None, false, None)
            .await
            .unwrap();
        keys.sort();
        keys
    }
}

fn subject(id: i64, subject: &str, priority: f64) -> Task {
    Task::new(id, 1)
        .with_priority(priority)
        .with_info(json!({"subject": subject}))
}

#[tokio::test]
async fn test_redundancy_and_release_lifecycle() {
    let h = Harness::new(json!({}));
    h.store.add_task(Task::new(1, 1).with_n_answers(2));

    assert_eq!(h.next(1).await, Some(1));
    assert_eq!(h.live_holders(1).await, 1);

    assert_eq!(h.next(2).await, Some(1));
    assert_eq!(h.live_holders(1).await, 2);

    assert_eq!(h.next(3).await, None);
    assert_eq!(h.active_users().await, 2);

    h.submit(1, 1).await;
    // Delayed release: still counted until the grace window passes
    assert_eq!(h.live_holders(1).await, 2);
    assert_eq!(h.active_users().await, 2);

    h.clock.advance(6.0);
    assert_eq!(h.live_holders(1).await, 1);
    assert_eq!(h.active_users().await, 1);
}

#[tokio::test]
async fn test_released_slot_goes_to_waiting_user() {
    let h = Harness::new(json!({}));
    h.store.add_task(Task::new(1, 1).with_n_answers(2));

    assert_eq!(h.next(1).await, Some(1));
    assert_eq!(h.next(2).await, Some(1));
    assert_eq!(h.next(3).await, None);

    // User 2 abandons the task without answering
    h.scheduler
        .release_lock(1, &Requester::user(2), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(h.next(3).await, None);

    h.clock.advance(6.0);
    assert_eq!(h.next(3).await, Some(1));
}

#[tokio::test]
async fn test_lock_expiry_frees_slot() {
    let h = Harness::new(json!({"timeout": 60}));
    h.store.add_task(Task::new(1, 1));

    assert_eq!(h.next(1).await, Some(1));
    assert_eq!(h.next(2).await, None);

    h.clock.advance(61.0);
    assert_eq!(h.next(2).await, Some(1));
}

#[tokio::test]
async fn test_reciprocal_keys_after_acquire() {
    let h = Harness::new(json!({}));
    h.store.add_task(Task::new(4, 1));

    assert!(h
        .scheduler
        .acquire_locks(4, "7", Some(1), TIMEOUT)
        .await
        .unwrap());

    let ctx = h.scheduler.context();
    let locks = ctx.lock_manager(TIMEOUT);
    assert!(locks.has_lock(&ctx.keys.task_users_key(4), "7").await.unwrap());
    assert!(locks
        .get_locks(&ctx.keys.user_tasks_key("7"))
        .await
        .unwrap()
        .contains_key("4"));

    // A full task is refused and leaves no user-side record
    assert!(!h
        .scheduler
        .acquire_locks(4, "8", Some(1), TIMEOUT)
        .await
        .unwrap());
    assert!(locks
        .get_locks(&ctx.keys.user_tasks_key("8"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_gold_tasks_are_unbounded() {
    let h = Harness::new(json!({}));
    h.store.add_task(Task::new(1, 1).gold());

    for user_id in 1..=6 {
        assert_eq!(h.next(user_id).await, Some(1));
    }
    assert_eq!(h.live_holders(1).await, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_respect_redundancy() {
    let h = Harness::new(json!({}));
    h.store.add_task(Task::new(1, 1).with_n_answers(3));

    let mut handles = Vec::new();
    for user_id in 1..=20 {
        let scheduler = Arc::clone(&h.scheduler);
        handles.push(tokio::spawn(async move {
            scheduler
                .new_task(&NewTaskRequest::new(1, Requester::user(user_id)))
                .await
                .unwrap()
                .len()
        }));
    }

    let mut assigned = 0;
    for handle in handles {
        assigned += handle.await.unwrap();
    }
    assert_eq!(assigned, 3);
    assert_eq!(h.live_holders(1).await, 3);
}

#[tokio::test]
async fn test_anonymous_contributors_are_scheduled_by_ip() {
    let h = Harness::new(json!({}));
    h.store.add_task(Task::new(1, 1).with_priority(1.0));
    h.store.add_task(Task::new(2, 1));

    let anon = Requester::anonymous("10.1.1.1");
    let tasks = h
        .scheduler
        .new_task(&NewTaskRequest::new(1, anon.clone()))
        .await
        .unwrap();
    assert_eq!(tasks[0].id, 1);

    h.store.add_task_run(1, &anon);
    h.scheduler.release_lock(1, &anon, TIMEOUT).await.unwrap();
    h.clock.advance(6.0);

    let tasks = h
        .scheduler
        .new_task(&NewTaskRequest::new(1, anon))
        .await
        .unwrap();
    assert_eq!(tasks[0].id, 2);
}

#[tokio::test]
async fn test_reservation_steers_other_users_away() {
    let h = Harness::new(json!({
        "sched": "task_queue_scheduler",
        "reserve_tasks": {"category": ["subject"]}
    }));
    h.store.add_task(subject(1, "math", 3.0));
    h.store.add_task(subject(2, "math", 2.0));
    h.store.add_task(subject(3, "art", 1.0));

    // User 1 takes the top task and reserves "math"
    assert_eq!(h.next(1).await, Some(1));
    assert_eq!(h.reservations_of(1).await.len(), 1);
    assert!(h.reservations_of(1).await[0].contains(":category:subject:math:"));

    // User 2 skips the reserved category although task 2 ranks higher
    assert_eq!(h.next(2).await, Some(3));

    // Only reserved categories remain, so user 3 shares one
    assert_eq!(h.next(3).await, Some(2));
}

#[tokio::test]
async fn test_exhausted_reservation_falls_back() {
    let h = Harness::new(json!({
        "sched": "task_queue_scheduler",
        "reserve_tasks": {"category": ["subject"]}
    }));
    h.store.add_task(subject(1, "math", 2.0));
    h.store.add_task(subject(2, "art", 1.0));

    assert_eq!(h.next(1).await, Some(1));
    h.submit(1, 1).await;
    h.clock.advance(6.0);

    // The math category has nothing left for user 1
    assert_eq!(h.next(1).await, Some(2));

    h.clock.advance(6.0);
    let keys = h.reservations_of(1).await;
    assert_eq!(keys.len(), 1);
    assert!(keys[0].contains(":category:subject:art:"));
}

#[tokio::test]
async fn test_available_tasks_with_reservations() {
    let h = Harness::new(json!({
        "sched": "task_queue_scheduler",
        "reserve_tasks": {"category": ["subject", "score"]}
    }));
    let categories = [("math", "47"), ("art", "10"), ("geo", "5"), ("hist", "3")];
    let mut id = 0;
    for (subject, score) in categories {
        for _ in 0..2 {
            id += 1;
            let priority = if id == 1 { 1.0 } else { 0.0 };
            h.store.add_task(
                Task::new(id, 1)
                    .with_priority(priority)
                    .with_info(json!({"subject": subject, "score": score.parse::<i64>().unwrap()})),
            );
        }
    }

    // User 1 reserves (math, 47) by taking task 1
    assert_eq!(h.next(1).await, Some(1));

    // User 9 holds four more categories, two of which have no tasks
    for (task_id, pairs) in [
        (100, [("subject", "math"), ("score", "47")]),
        (101, [("subject", "art"), ("score", "10")]),
        (102, [("subject", "bio"), ("score", "1")]),
        (103, [("subject", "chem"), ("score", "2")]),
    ] {
        h.reserve(9, task_id, &pairs).await;
    }

    // User 2 answered one geo task; math and art are reserved by others
    h.store.add_task_run(5, &Requester::user(2));
    let available = h
        .scheduler
        .n_available_tasks_for_user(1, &Requester::user(2))
        .await
        .unwrap();
    assert_eq!(available, 3);

    // User 1 is narrowed to their own category
    let available = h
        .scheduler
        .n_available_tasks_for_user(1, &Requester::user(1))
        .await
        .unwrap();
    assert_eq!(available, 2);
}

#[tokio::test]
async fn test_saved_task_resumes_first() {
    let h = Harness::new(json!({}));
    h.store.add_task(Task::new(1, 1).with_priority(3.0));
    h.store.add_task(Task::new(2, 1).with_priority(2.0));
    h.store.add_task(Task::new(3, 1).with_priority(1.0));

    assert!(h
        .scheduler
        .partial_answers()
        .save(1, "5", 3)
        .await
        .unwrap());

    let request = NewTaskRequest::new(1, Requester::user(5))
        .with_saved_task_position(SavedTaskPosition::First);
    let tasks = h.scheduler.new_task(&request).await.unwrap();
    assert_eq!(tasks[0].id, 3);
}

#[tokio::test]
async fn test_user_preferences_filter_candidates() {
    let h = Harness::new(json!({"sched": "user_pref_scheduler"}));
    h.store.add_task(
        Task::new(1, 1)
            .with_priority(2.0)
            .with_user_pref(json!({"languages": ["de"]})),
    );
    h.store.add_task(
        Task::new(2, 1)
            .with_priority(1.0)
            .with_user_pref(json!({"languages": ["en"]})),
    );
    h.store.set_user_profile(
        5,
        UserProfile {
            languages: vec!["en".to_string()],
            ..Default::default()
        },
    );

    assert_eq!(h.next(5).await, Some(2));
    // Nobody else speaks German either
    assert_eq!(h.next(6).await, None);
}
