//! Wall-clock abstraction used for all expiration math.
//!
//! Every lock, reservation and registry entry stores its expiration as
//! seconds since the epoch (`f64`). The clock is injected so tests can move
//! time forward deterministically.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};

/// Source of the current time in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Returns the current time as fractional seconds since the epoch.
    fn now(&self) -> f64;

    /// Returns the current time as a UTC datetime.
    fn now_utc(&self) -> DateTime<Utc> {
        to_datetime(self.now())
    }
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Creates a clock frozen at `start` seconds since the epoch.
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Moves the clock forward by `secs` seconds.
    pub fn advance(&self, secs: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += secs;
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, secs: f64) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = secs;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000.0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Converts epoch seconds into a UTC datetime, clamping unrepresentable values to the epoch.
pub fn to_datetime(secs: f64) -> DateTime<Utc> {
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1_000_000_000.0).round() as u32;
    Utc.timestamp_opt(whole, nanos.min(999_999_999))
        .single()
        .unwrap_or_default()
}
