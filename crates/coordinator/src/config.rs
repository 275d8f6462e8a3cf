//! Transaction manager configuration

use crate::error::{Result, TransactionError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tandem_journal_disk::DiskJournalConfig;
use tandem_xa::config::duration_ms;

/// Journal implementation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalKind {
    /// Dual-fragment files on disk
    Disk,
    /// In-process memory, lost on exit
    Memory,
    /// No journal at all; recovery presumes abort for everything
    Null,
}

/// Transaction manager settings.
///
/// Read once when the manager starts and never changed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Identifies this node inside every GTRID; must be ASCII and unique
    pub server_id: String,

    #[serde(with = "duration_ms")]
    pub default_transaction_timeout: Duration,

    /// How long shutdown waits for in-flight transactions
    #[serde(with = "duration_ms")]
    pub graceful_shutdown_interval: Duration,

    /// Interval of background recovery runs, zero disables them
    #[serde(with = "duration_ms")]
    pub background_recovery_interval: Duration,

    /// Interval of pool shrinking, zero disables it
    #[serde(with = "duration_ms")]
    pub pool_shrink_interval: Duration,

    pub journal: JournalKind,
    pub log_part1_filename: PathBuf,
    pub log_part2_filename: PathBuf,
    pub max_log_size: u64,
    pub forced_write_enabled: bool,
    pub force_batching_enabled: bool,
    pub skip_corrupted_logs: bool,

    /// Only journal COMMITTING, COMMITTED and UNKNOWN records
    pub filter_log_status: bool,

    /// Run branch operations of one phase concurrently
    pub asynchronous_2pc: bool,

    /// Upper bound on concurrent branch operations with `asynchronous_2pc`
    pub max_async_workers: usize,

    pub warn_about_zero_resource_transaction: bool,

    /// Only recover branches whose GTRID carries this node's server id
    pub current_node_only_recovery: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            default_transaction_timeout: Duration::from_secs(60),
            graceful_shutdown_interval: Duration::from_secs(60),
            background_recovery_interval: Duration::from_secs(60),
            pool_shrink_interval: Duration::from_secs(60),
            journal: JournalKind::Disk,
            log_part1_filename: PathBuf::from("tandem-part1.tlog"),
            log_part2_filename: PathBuf::from("tandem-part2.tlog"),
            max_log_size: 2 * 1024 * 1024,
            forced_write_enabled: true,
            force_batching_enabled: true,
            skip_corrupted_logs: false,
            filter_log_status: false,
            asynchronous_2pc: false,
            max_async_workers: 16,
            warn_about_zero_resource_transaction: true,
            current_node_only_recovery: true,
        }
    }
}

impl Configuration {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON document, missing fields taking their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TransactionError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_default_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.default_transaction_timeout = timeout;
        self
    }

    pub fn with_graceful_shutdown_interval(mut self, interval: Duration) -> Self {
        self.graceful_shutdown_interval = interval;
        self
    }

    pub fn with_background_recovery_interval(mut self, interval: Duration) -> Self {
        self.background_recovery_interval = interval;
        self
    }

    pub fn with_pool_shrink_interval(mut self, interval: Duration) -> Self {
        self.pool_shrink_interval = interval;
        self
    }

    pub fn with_journal(mut self, journal: JournalKind) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_log_parts(mut self, part1: impl Into<PathBuf>, part2: impl Into<PathBuf>) -> Self {
        self.log_part1_filename = part1.into();
        self.log_part2_filename = part2.into();
        self
    }

    pub fn with_max_log_size(mut self, bytes: u64) -> Self {
        self.max_log_size = bytes;
        self
    }

    pub fn with_forced_write(mut self, enabled: bool) -> Self {
        self.forced_write_enabled = enabled;
        self
    }

    pub fn with_force_batching(mut self, enabled: bool) -> Self {
        self.force_batching_enabled = enabled;
        self
    }

    pub fn with_skip_corrupted_logs(mut self, enabled: bool) -> Self {
        self.skip_corrupted_logs = enabled;
        self
    }

    pub fn with_filter_log_status(mut self, enabled: bool) -> Self {
        self.filter_log_status = enabled;
        self
    }

    /// Run branch operations concurrently, at most `max_workers` at a time.
    pub fn with_asynchronous_2pc(mut self, max_workers: usize) -> Self {
        self.asynchronous_2pc = true;
        self.max_async_workers = max_workers;
        self
    }

    pub fn with_warn_about_zero_resource_transaction(mut self, enabled: bool) -> Self {
        self.warn_about_zero_resource_transaction = enabled;
        self
    }

    pub fn with_current_node_only_recovery(mut self, enabled: bool) -> Self {
        self.current_node_only_recovery = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_id.is_empty() {
            return Err(TransactionError::Configuration(
                "server id must not be empty".to_string(),
            ));
        }
        if !self.server_id.is_ascii() {
            return Err(TransactionError::Configuration(format!(
                "server id '{}' must be ASCII",
                self.server_id
            )));
        }
        if self.default_transaction_timeout.is_zero() {
            return Err(TransactionError::Configuration(
                "default transaction timeout must be greater than 0".to_string(),
            ));
        }
        if self.asynchronous_2pc && self.max_async_workers == 0 {
            return Err(TransactionError::Configuration(
                "asynchronous 2PC needs at least one worker".to_string(),
            ));
        }
        if self.journal == JournalKind::Disk
            && self.log_part1_filename == self.log_part2_filename
        {
            return Err(TransactionError::Configuration(
                "journal fragments must be two different files".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings of the disk journal described by this configuration.
    pub fn disk_journal_config(&self) -> DiskJournalConfig {
        DiskJournalConfig::default()
            .with_parts(&self.log_part1_filename, &self.log_part2_filename)
            .with_max_log_size(self.max_log_size)
            .with_forced_write(self.forced_write_enabled)
            .with_force_batching(self.force_batching_enabled)
            .with_skip_corrupted_logs(self.skip_corrupted_logs)
    }
}
