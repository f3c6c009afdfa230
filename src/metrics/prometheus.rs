//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by crowd-sched and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{Counter, CounterVec, Encoder, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all crowd-sched metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Task lock attempts, labeled by outcome (claimed, already_held, full).
pub static LOCK_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Tasks handed to users, labeled by scheduler and assignment kind.
pub static TASKS_ASSIGNED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Scheduling calls that produced no task, labeled by scheduler.
pub static NO_TASK_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Category reservation operations, labeled by outcome.
pub static RESERVATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task locks released on submission or cancellation.
pub static LOCKS_RELEASED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Time spent selecting a task, labeled by scheduler.
pub static SELECTION_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Recording
/// before initialization is a silent no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Lock metrics
    let lock_attempts_total = CounterVec::new(
        Opts::new("crowd_sched_lock_attempts_total", "Total task lock attempts"),
        &["outcome"],
    )?;

    let locks_released_total = Counter::new(
        "crowd_sched_locks_released_total",
        "Total task locks released",
    )?;

    // Scheduling metrics
    let tasks_assigned_total = CounterVec::new(
        Opts::new(
            "crowd_sched_tasks_assigned_total",
            "Total tasks assigned to users",
        ),
        &["scheduler", "kind"],
    )?;

    let no_task_total = CounterVec::new(
        Opts::new(
            "crowd_sched_no_task_total",
            "Total scheduling calls that found no task",
        ),
        &["scheduler"],
    )?;

    let selection_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "crowd_sched_selection_duration_seconds",
            "Task selection duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["scheduler"],
    )?;

    // Reservation metrics
    let reservations_total = CounterVec::new(
        Opts::new(
            "crowd_sched_reservations_total",
            "Total category reservation operations",
        ),
        &["outcome"],
    )?;

    registry.register(Box::new(lock_attempts_total.clone()))?;
    registry.register(Box::new(locks_released_total.clone()))?;
    registry.register(Box::new(tasks_assigned_total.clone()))?;
    registry.register(Box::new(no_task_total.clone()))?;
    registry.register(Box::new(selection_duration.clone()))?;
    registry.register(Box::new(reservations_total.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = LOCK_ATTEMPTS_TOTAL.set(lock_attempts_total);
    let _ = LOCKS_RELEASED_TOTAL.set(locks_released_total);
    let _ = TASKS_ASSIGNED_TOTAL.set(tasks_assigned_total);
    let _ = NO_TASK_TOTAL.set(no_task_total);
    let _ = SELECTION_DURATION.set(selection_duration);
    let _ = RESERVATIONS_TOTAL.set(reservations_total);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_after_init() {
        let _ = init_metrics();

        if let Some(released) = LOCKS_RELEASED_TOTAL.get() {
            released.inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        if REGISTRY.get().is_some() {
            assert!(metrics.contains("crowd_sched_locks_released_total"));
        }
    }
}
