//! crowd-sched: task scheduling and distributed locking for crowdsourcing.
//!
//! This library hands each requesting contributor the right task under
//! concurrent access from many worker processes. It enforces redundancy
//! limits with bounded-occupancy locks in a shared expiring store, steers
//! contributors through category reservations, and tracks active users
//! per project.

// Core modules
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod identity;
pub mod kv;
pub mod locks;
pub mod metrics;
pub mod partial;
pub mod registry;
pub mod reservation;
pub mod sched;
pub mod store;

// Re-export commonly used types
pub use config::SchedulerConfig;
pub use error::{ConfigError, RepositoryError, SchedulerError, StoreError};
pub use identity::Requester;
pub use sched::{NewTaskRequest, Scheduler, SchedulerKind};
