//! Distributed locks over the shared expiring store.
//!
//! - **keys**: naming of every key the core writes
//! - **manager**: bounded-occupancy locks with delayed release, plus the
//!   single-owner reservation primitives
//!
//! [`LockContext`] bundles the dependencies every store-backed component
//! needs (store, clock, key space, configuration). It is built once by the
//! process bootstrap and cloned into each component.

pub mod keys;
pub mod manager;

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::kv::KeyValueStore;

pub use keys::{KeySpace, ReservationKey};
pub use manager::LockManager;

/// Shared dependencies of the store-backed components.
#[derive(Clone)]
pub struct LockContext {
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub keys: KeySpace,
    pub config: Arc<SchedulerConfig>,
}

impl LockContext {
    /// Creates a context whose key space uses the configured prefix.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            keys: KeySpace::new(config.key_prefix.clone()),
            config: Arc::new(config),
        }
    }

    /// A lock manager whose locks last `timeout`.
    pub fn lock_manager(&self, timeout: Duration) -> LockManager {
        LockManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.keys.clone(),
            timeout,
        )
        .with_release_delay(self.config.release_delay)
    }

    /// Current time in seconds since the epoch.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }
}
