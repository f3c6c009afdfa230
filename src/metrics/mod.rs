//! Metrics module for Prometheus-based monitoring.
//!
//! Counts lock attempts, task assignments, empty scheduling results and
//! reservation activity.
//!
//! # Example
//!
//! ```ignore
//! use crowd_sched::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_lock_attempt("claimed");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    LOCKS_RELEASED_TOTAL, LOCK_ATTEMPTS_TOTAL, NO_TASK_TOTAL, REGISTRY, RESERVATIONS_TOTAL,
    SELECTION_DURATION, TASKS_ASSIGNED_TOTAL,
};
