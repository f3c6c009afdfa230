//! High-level recording interface over the raw Prometheus metrics.
//!
//! The scheduler records through `MetricsCollector` so that labels stay
//! consistent and recording before `init_metrics()` is a no-op.

use super::prometheus::{
    LOCKS_RELEASED_TOTAL, LOCK_ATTEMPTS_TOTAL, NO_TASK_TOTAL, RESERVATIONS_TOTAL,
    SELECTION_DURATION, TASKS_ASSIGNED_TOTAL,
};

/// Metrics collector for scheduling and locking outcomes.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one lock attempt.
    ///
    /// # Arguments
    ///
    /// * `outcome` - "claimed", "already_held" or "full"
    pub fn record_lock_attempt(&self, outcome: &str) {
        if let Some(attempts) = LOCK_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[outcome]).inc();
        }

        tracing::trace!(outcome = outcome, "Recorded lock attempt metric");
    }

    /// Record a released task lock.
    pub fn record_lock_released(&self) {
        if let Some(released) = LOCKS_RELEASED_TOTAL.get() {
            released.inc();
        }
    }

    /// Record the result of a scheduling call.
    ///
    /// # Arguments
    ///
    /// * `scheduler` - Scheduler name the call resolved to
    /// * `kind` - How the task was found ("selected", "gold", "already_locked", "direct"),
    ///   `None` when no task was available
    /// * `duration_secs` - Time spent in selection
    pub fn record_selection(&self, scheduler: &str, kind: Option<&str>, duration_secs: f64) {
        match kind {
            Some(kind) => {
                if let Some(assigned) = TASKS_ASSIGNED_TOTAL.get() {
                    assigned.with_label_values(&[scheduler, kind]).inc();
                }
            }
            None => {
                if let Some(no_task) = NO_TASK_TOTAL.get() {
                    no_task.with_label_values(&[scheduler]).inc();
                }
            }
        }

        if let Some(duration) = SELECTION_DURATION.get() {
            duration
                .with_label_values(&[scheduler])
                .observe(duration_secs);
        }

        tracing::trace!(
            scheduler = scheduler,
            kind = kind.unwrap_or("none"),
            duration_secs = duration_secs,
            "Recorded selection metric"
        );
    }

    /// Record a reservation operation ("acquired", "skipped", "released").
    pub fn record_reservation(&self, outcome: &str) {
        if let Some(reservations) = RESERVATIONS_TOTAL.get() {
            reservations.with_label_values(&[outcome]).inc();
        }
    }
}
