//! Relational collaborators of the scheduler.
//!
//! The scheduler never talks to the database directly; it goes through the
//! narrow traits below:
//!
//! - **TaskStore**: task lookup and the parameterized candidate query
//! - **ProjectStore**: project lookup (settings come from `project.info`)
//! - **UserStore**: contributor profiles for preference matching
//!
//! `PgStore` implements all three over PostgreSQL; `MemoryTaskStore` keeps
//! everything in process for tests and local runs.

pub mod memory;
pub mod postgres;
pub mod types;

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::sched::UserProfile;

pub use memory::MemoryTaskStore;
pub use postgres::PgStore;
pub use types::{
    CandidateQuery, CandidateRow, OrderColumn, Project, ProjectSettings, Task, TaskOrder,
    TaskState,
};

/// Task lookups and candidate selection.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, task_id: i64) -> Result<Option<Task>, RepositoryError>;

    /// Task `task_id` if it belongs to `project_id`.
    async fn get_task_by(
        &self,
        project_id: i64,
        task_id: i64,
    ) -> Result<Option<Task>, RepositoryError>;

    /// Number of task runs submitted for a task.
    async fn count_task_runs(&self, task_id: i64) -> Result<i64, RepositoryError>;

    /// Eligible candidates in query order, at most `query.limit`.
    async fn get_candidate_tasks(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<CandidateRow>, RepositoryError>;

    /// Number of eligible candidates, ignoring limit and offset.
    async fn count_candidate_tasks(&self, query: &CandidateQuery) -> Result<usize, RepositoryError>;
}

/// Project lookups.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get_project(&self, project_id: i64) -> Result<Option<Project>, RepositoryError>;
}

/// Contributor profile lookups.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_profile(&self, user_id: i64) -> Result<Option<UserProfile>, RepositoryError>;
}
