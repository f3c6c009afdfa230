//! Scheduler configuration.
//!
//! Process-wide settings for the locking and scheduling core: store
//! locations, lock timings, batch sizing and the reservation switch.
//! Per-project settings live in [`crate::store::ProjectSettings`].

use std::time::Duration;

use crate::error::ConfigError;

/// Default lock timeout when a project does not configure one (1 hour).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Grace period applied when a lock or registry entry is released.
pub const DEFAULT_RELEASE_DELAY: Duration = Duration::from_secs(5);

/// Extra lifetime of a category reservation beyond the lock timeout.
pub const DEFAULT_RESERVATION_GRACE: Duration = Duration::from_secs(30 * 60);

/// Lifetime of contribution guard stamps.
pub const DEFAULT_STAMP_TTL: Duration = Duration::from_secs(60 * 60);

/// Configuration for the scheduling core.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // Connections
    /// Redis connection URL for the shared expiring store.
    pub redis_url: String,
    /// PostgreSQL connection URL for the task repository.
    pub database_url: Option<String>,
    /// Namespace prepended to every key written to the shared store.
    pub key_prefix: String,

    // Lock timings
    /// Lock timeout used when a project does not set one.
    pub default_timeout: Duration,
    /// Delay before a released lock stops counting as held.
    pub release_delay: Duration,
    /// Extra lifetime of a reservation beyond the lock timeout.
    pub reservation_grace: Duration,
    /// Lifetime of "requested" and "presented" stamps.
    pub stamp_ttl: Duration,
    /// Lifetime of saved partial answers.
    pub partial_answer_ttl: Duration,
    /// Minimum remaining lock time for the already-locked fast path.
    pub min_remaining_lock: Duration,

    // Candidate batch sizing
    /// Fixed slack added to the active user count when sizing a batch.
    pub batch_slack: usize,
    /// Maximum number of saved partial answers a user may hold.
    pub max_saved_answers: usize,
    /// Candidate batch size used by preference scheduling.
    pub max_preference_batch: usize,

    // Features
    /// Whether category reservations are enabled for this deployment.
    pub reservation_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: None,
            key_prefix: "crowdsched".to_string(),

            default_timeout: DEFAULT_TIMEOUT,
            release_delay: DEFAULT_RELEASE_DELAY,
            reservation_grace: DEFAULT_RESERVATION_GRACE,
            stamp_ttl: DEFAULT_STAMP_TTL,
            partial_answer_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            min_remaining_lock: Duration::from_secs(10),

            batch_slack: 5,
            max_saved_answers: 30,
            max_preference_batch: 1000,

            reservation_enabled: true,
        }
    }
}

impl SchedulerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CROWD_SCHED_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `DATABASE_URL`: PostgreSQL URL (optional here, required by the CLI)
    /// - `CROWD_SCHED_KEY_PREFIX`: Key namespace (default: crowdsched)
    /// - `CROWD_SCHED_DEFAULT_TIMEOUT_SECS`: Lock timeout (default: 3600)
    /// - `CROWD_SCHED_RELEASE_DELAY_SECS`: Release grace window (default: 5)
    /// - `CROWD_SCHED_RESERVATION_GRACE_SECS`: Reservation extra lifetime (default: 1800)
    /// - `CROWD_SCHED_STAMP_TTL_SECS`: Contribution stamp lifetime (default: 3600)
    /// - `CROWD_SCHED_PARTIAL_ANSWER_TTL_SECS`: Saved answer lifetime (default: 604800)
    /// - `CROWD_SCHED_MIN_REMAINING_SECS`: Already-locked threshold (default: 10)
    /// - `CROWD_SCHED_BATCH_SLACK`: Batch slack (default: 5)
    /// - `CROWD_SCHED_MAX_SAVED_ANSWERS`: Saved answers per user (default: 30)
    /// - `CROWD_SCHED_MAX_PREFERENCE_BATCH`: Preference batch size (default: 1000)
    /// - `CROWD_SCHED_RESERVATION_ENABLED`: Enable reservations (default: true)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or validation fails.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Connections
        if let Ok(val) = std::env::var("CROWD_SCHED_REDIS_URL") {
            config.redis_url = val;
        }

        config.database_url = std::env::var("DATABASE_URL").ok();

        if let Ok(val) = std::env::var("CROWD_SCHED_KEY_PREFIX") {
            config.key_prefix = val;
        }

        // Lock timings
        if let Ok(val) = std::env::var("CROWD_SCHED_DEFAULT_TIMEOUT_SECS") {
            config.default_timeout = parse_env_secs(&val, "CROWD_SCHED_DEFAULT_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("CROWD_SCHED_RELEASE_DELAY_SECS") {
            config.release_delay = parse_env_secs(&val, "CROWD_SCHED_RELEASE_DELAY_SECS")?;
        }

        if let Ok(val) = std::env::var("CROWD_SCHED_RESERVATION_GRACE_SECS") {
            config.reservation_grace = parse_env_secs(&val, "CROWD_SCHED_RESERVATION_GRACE_SECS")?;
        }

        if let Ok(val) = std::env::var("CROWD_SCHED_STAMP_TTL_SECS") {
            config.stamp_ttl = parse_env_secs(&val, "CROWD_SCHED_STAMP_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("CROWD_SCHED_PARTIAL_ANSWER_TTL_SECS") {
            config.partial_answer_ttl =
                parse_env_secs(&val, "CROWD_SCHED_PARTIAL_ANSWER_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("CROWD_SCHED_MIN_REMAINING_SECS") {
            config.min_remaining_lock = parse_env_secs(&val, "CROWD_SCHED_MIN_REMAINING_SECS")?;
        }

        // Batch sizing
        if let Ok(val) = std::env::var("CROWD_SCHED_BATCH_SLACK") {
            config.batch_slack = parse_env_value(&val, "CROWD_SCHED_BATCH_SLACK")?;
        }

        if let Ok(val) = std::env::var("CROWD_SCHED_MAX_SAVED_ANSWERS") {
            config.max_saved_answers = parse_env_value(&val, "CROWD_SCHED_MAX_SAVED_ANSWERS")?;
        }

        if let Ok(val) = std::env::var("CROWD_SCHED_MAX_PREFERENCE_BATCH") {
            config.max_preference_batch =
                parse_env_value(&val, "CROWD_SCHED_MAX_PREFERENCE_BATCH")?;
        }

        // Features
        if let Ok(val) = std::env::var("CROWD_SCHED_RESERVATION_ENABLED") {
            config.reservation_enabled = parse_env_bool(&val, "CROWD_SCHED_RESERVATION_ENABLED")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::Validation(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() || self.key_prefix.contains('*') {
            return Err(ConfigError::Validation(
                "key_prefix must be non-empty and must not contain '*'".to_string(),
            ));
        }

        if self.default_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "default_timeout must be greater than 0".to_string(),
            ));
        }

        if self.release_delay >= self.default_timeout {
            return Err(ConfigError::Validation(
                "release_delay must be shorter than default_timeout".to_string(),
            ));
        }

        if self.stamp_ttl.is_zero() {
            return Err(ConfigError::Validation(
                "stamp_ttl must be greater than 0".to_string(),
            ));
        }

        if self.max_preference_batch == 0 {
            return Err(ConfigError::Validation(
                "max_preference_batch must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the key namespace.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the default lock timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the release grace window.
    pub fn with_release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
        self
    }

    /// Enables or disables category reservations.
    pub fn with_reservations(mut self, enabled: bool) -> Self {
        self.reservation_enabled = enabled;
        self
    }

    /// Sets the batch slack.
    pub fn with_batch_slack(mut self, slack: usize) -> Self {
        self.batch_slack = slack;
        self
    }
}

/// Parse an environment variable value into a `FromStr` type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse an environment variable holding whole seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: key.to_string(),
            value: value.to_string(),
        }),
    }
}
