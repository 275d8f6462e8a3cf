//! Per-resource configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_scheduler::DEFAULT_POSITION;

/// Configuration of one transactional resource and its pool.
///
/// Durations are serialized as milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Name identifying the resource in the journal and during recovery
    pub unique_name: String,

    /// Pooled objects kept open even when idle
    pub min_pool_size: usize,

    /// Upper bound on pooled objects
    pub max_pool_size: usize,

    /// How many objects to create when the pool has to grow
    pub acquire_increment: usize,

    /// Idle time after which surplus pooled objects are closed
    #[serde(with = "duration_ms")]
    pub max_idle_time: Duration,

    /// How long an acquisition waits for a free pooled object
    #[serde(with = "duration_ms")]
    pub acquisition_timeout: Duration,

    /// Delay between acquisition retries
    #[serde(with = "duration_ms")]
    pub acquisition_interval: Duration,

    /// Enlist connections in the current transaction when they are handed out
    pub automatic_enlisting_enabled: bool,

    /// Join branches of the same resource manager instead of starting new ones
    pub use_tm_join: bool,

    /// Keep a closed connection out of the pool until its transaction completes
    pub defer_connection_release: bool,

    /// Allow connections to be used outside a global transaction
    pub allow_local_transactions: bool,

    /// Hand the same connection to every acquisition inside one transaction
    pub share_transaction_connections: bool,

    /// Scheduler position during two-phase commit
    pub two_pc_ordering_position: i32,

    /// Pass the remaining transaction timeout to the resource on enlistment
    pub apply_transaction_timeout: bool,

    /// Do not mark the resource failed when its recovery fails
    pub ignore_recovery_failures: bool,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            unique_name: String::new(),
            min_pool_size: 0,
            max_pool_size: 10,
            acquire_increment: 1,
            max_idle_time: Duration::from_secs(60),
            acquisition_timeout: Duration::from_secs(30),
            acquisition_interval: Duration::from_secs(1),
            automatic_enlisting_enabled: true,
            use_tm_join: true,
            defer_connection_release: true,
            allow_local_transactions: false,
            share_transaction_connections: false,
            two_pc_ordering_position: DEFAULT_POSITION,
            apply_transaction_timeout: false,
            ignore_recovery_failures: false,
        }
    }
}

impl ResourceConfig {
    /// Create a config with the given unique name and default settings
    pub fn new(unique_name: impl Into<String>) -> Self {
        Self {
            unique_name: unique_name.into(),
            ..Default::default()
        }
    }

    /// Set pool bounds
    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.min_pool_size = min;
        self.max_pool_size = max;
        self
    }

    /// Set acquire increment
    pub fn with_acquire_increment(mut self, increment: usize) -> Self {
        self.acquire_increment = increment;
        self
    }

    /// Set max idle time
    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    /// Set acquisition timeout and retry interval
    pub fn with_acquisition(mut self, timeout: Duration, interval: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self.acquisition_interval = interval;
        self
    }

    /// Set automatic enlistment
    pub fn with_automatic_enlisting(mut self, enabled: bool) -> Self {
        self.automatic_enlisting_enabled = enabled;
        self
    }

    /// Set TMJOIN usage
    pub fn with_use_tm_join(mut self, enabled: bool) -> Self {
        self.use_tm_join = enabled;
        self
    }

    /// Set deferred connection release
    pub fn with_defer_connection_release(mut self, enabled: bool) -> Self {
        self.defer_connection_release = enabled;
        self
    }

    /// Set local transaction support
    pub fn with_allow_local_transactions(mut self, enabled: bool) -> Self {
        self.allow_local_transactions = enabled;
        self
    }

    /// Set connection sharing within a transaction
    pub fn with_share_transaction_connections(mut self, enabled: bool) -> Self {
        self.share_transaction_connections = enabled;
        self
    }

    /// Set two-phase commit ordering position
    pub fn with_two_pc_ordering_position(mut self, position: i32) -> Self {
        self.two_pc_ordering_position = position;
        self
    }

    /// Set transaction timeout propagation
    pub fn with_apply_transaction_timeout(mut self, enabled: bool) -> Self {
        self.apply_transaction_timeout = enabled;
        self
    }

    /// Set recovery failure handling
    pub fn with_ignore_recovery_failures(mut self, enabled: bool) -> Self {
        self.ignore_recovery_failures = enabled;
        self
    }

    /// Check the settings are consistent
    pub fn validate(&self) -> Result<(), String> {
        if self.unique_name.is_empty() {
            return Err("resource unique name must not be empty".to_string());
        }
        if !self.unique_name.is_ascii() {
            return Err(format!(
                "resource unique name '{}' must be ASCII",
                self.unique_name
            ));
        }
        if self.max_pool_size == 0 {
            return Err(format!(
                "resource '{}': max pool size must be greater than 0",
                self.unique_name
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(format!(
                "resource '{}': min pool size {} exceeds max pool size {}",
                self.unique_name, self.min_pool_size, self.max_pool_size
            ));
        }
        if self.acquire_increment == 0 {
            return Err(format!(
                "resource '{}': acquire increment must be at least 1",
                self.unique_name
            ));
        }
        Ok(())
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
