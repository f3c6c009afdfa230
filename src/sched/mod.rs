//! Task selection.
//!
//! - **driver**: the [`Scheduler`] and its locking protocol
//! - **policy**: the three scheduling policies behind [`TaskSelector`]
//! - **preferences**: worker filters and preference scoring
//! - **gold**: gold task ordering and saved-position ranking
//!
//! # Example
//!
//! ```rust,ignore
//! use crowd_sched::identity::Requester;
//! use crowd_sched::sched::{NewTaskRequest, Scheduler};
//!
//! let scheduler = Scheduler::from_store(ctx, store);
//! let tasks = scheduler
//!     .new_task(&NewTaskRequest::new(project_id, Requester::user(42)))
//!     .await?;
//! ```

pub mod driver;
pub mod gold;
pub mod policy;
pub mod preferences;

pub use driver::{NewTaskRequest, Scheduler, MAX_OFFSET};
pub use gold::{GoldMode, SavedTaskPosition, DEFAULT_GOLD_PROBABILITY};
pub use policy::{
    LockedSelector, RankContext, SchedulerKind, TaskQueueSelector, TaskSelector, UserPrefSelector,
};
pub use preferences::{
    preference_score, Comparator, UserPref, UserProfile, WorkerFilter, WorkerPreference,
};
