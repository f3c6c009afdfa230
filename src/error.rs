//! Error types for crowd-sched operations.
//!
//! Defines error types for each subsystem:
//! - Shared expiring key/value store (locks, reservations, registry)
//! - Relational task/project/user repositories
//! - Task scheduling
//! - Configuration loading
//!
//! Lock contention is never an error: losing a race yields `false` or an
//! empty result, not an `Err`.

use thiserror::Error;

/// Errors that can occur while talking to the shared key/value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid value '{value}' stored under key '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("Invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Errors that can occur in the relational task/project/user repositories.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the scheduler to its caller.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Caller misuse (bad offset, missing identity); never retried.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Project {0} not found")]
    ProjectNotFound(i64),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl SchedulerError {
    /// Returns true when the error is the caller's fault rather than an infrastructure failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, SchedulerError::BadRequest(_))
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value '{value}' for {name}")]
    InvalidValue { name: String, value: String },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_error_display() {
        let err = SchedulerError::BadRequest("offset must be <= 2".to_string());
        assert!(err.to_string().contains("offset"));
        assert!(err.is_client_error());

        let err = SchedulerError::ProjectNotFound(42);
        assert!(err.to_string().contains("42"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_store_error_wraps_into_scheduler_error() {
        let err: SchedulerError = StoreError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, SchedulerError::Store(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            name: "CROWD_SCHED_BATCH_SLACK".to_string(),
            value: "abc".to_string(),
        };
        assert!(err.to_string().contains("CROWD_SCHED_BATCH_SLACK"));
        assert!(err.to_string().contains("abc"));

        let err = ConfigError::MissingEnvVar("DATABASE_URL".to_string());
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
