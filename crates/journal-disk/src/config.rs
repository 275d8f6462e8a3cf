use std::path::{Path, PathBuf};

/// Settings of a [`DiskJournal`](crate::DiskJournal).
#[derive(Debug, Clone)]
pub struct DiskJournalConfig {
    /// First fragment file
    pub part1: PathBuf,
    /// Second fragment file
    pub part2: PathBuf,
    /// Size at which the active fragment is swapped out
    pub max_log_size: u64,
    /// Sync records to stable storage on `force`
    pub forced_write_enabled: bool,
    /// Let one sync serve every concurrent `force`
    pub force_batching_enabled: bool,
    /// Truncate at the first unreadable record instead of failing
    pub skip_corrupted_logs: bool,
}

impl Default for DiskJournalConfig {
    fn default() -> Self {
        Self {
            part1: PathBuf::from("tandem-part1.tlog"),
            part2: PathBuf::from("tandem-part2.tlog"),
            max_log_size: 2 * 1024 * 1024,
            forced_write_enabled: true,
            force_batching_enabled: true,
            skip_corrupted_logs: false,
        }
    }
}

impl DiskJournalConfig {
    /// Both fragments inside `dir`, with the default file names.
    pub fn in_directory(dir: impl AsRef<Path>) -> Self {
        let defaults = Self::default();
        Self {
            part1: dir.as_ref().join(&defaults.part1),
            part2: dir.as_ref().join(&defaults.part2),
            ..defaults
        }
    }

    pub fn with_parts(mut self, part1: impl Into<PathBuf>, part2: impl Into<PathBuf>) -> Self {
        self.part1 = part1.into();
        self.part2 = part2.into();
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
}
