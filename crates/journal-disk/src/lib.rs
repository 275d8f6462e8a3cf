//! Dual-fragment on-disk journal
//!
//! Records are appended to the active fragment. When a record would push the
//! active fragment past `max_log_size`, the dangling records are copied to
//! the other fragment, which becomes active. The active fragment is the one
//! whose header carries the newest timestamp.

mod batch;
mod codec;
mod config;
mod fragment;

pub use codec::{RECORD_END_MARKER, checksum, decode_record, encode_record};
pub use config::DiskJournalConfig;
pub use fragment::{CLEAN_STATE, HEADER_LEN, MAGIC, UNCLEAN_STATE};

use batch::ForceBatcher;
use fragment::Fragment;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tandem_journal::{Journal, JournalError, JournalRecord, Result, collect_dangling};
use tandem_uid::{MonotonicClock, Uid};
use tandem_xa::Status;

struct Fragments {
    active: Fragment,
    standby: Fragment,
}

/// Journal stored in two alternating files.
pub struct DiskJournal {
    config: DiskJournalConfig,
    fragments: Mutex<Option<Fragments>>,
    batcher: ForceBatcher,
    sequence: AtomicU32,
    clock: Arc<MonotonicClock>,
}

impl DiskJournal {
    pub fn new(config: DiskJournalConfig) -> Self {
        Self {
            config,
            fragments: Mutex::new(None),
            batcher: ForceBatcher::new(),
            sequence: AtomicU32::new(0),
            clock: MonotonicClock::global(),
        }
    }

    pub fn config(&self) -> &DiskJournalConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.fragments.lock().is_some()
    }

    /// Every readable record of the active fragment, oldest first.
    pub fn read_active_records(&self) -> Result<Vec<JournalRecord>> {
        let mut guard = self.fragments.lock();
        let fragments = guard.as_mut().ok_or(JournalError::NotOpen)?;
        fragments
            .active
            .read_records(self.config.skip_corrupted_logs)
    }

    /// Copy the dangling records into the standby fragment and make it active.
    fn swap(&self, fragments: &mut Fragments) -> Result<()> {
        let mut dangling: Vec<JournalRecord> = collect_dangling(
            fragments
                .active
                .read_records(self.config.skip_corrupted_logs)?,
        )
        .into_values()
        .collect();
        dangling.sort_by_key(|record| (record.time, record.sequence));

        let mut bytes = Vec::new();
        for record in &dangling {
            bytes.extend(encode_record(record).map_err(JournalError::Failed)?);
        }
        if HEADER_LEN + bytes.len() as u64 > self.config.max_log_size {
            return Err(JournalError::RecordTooLarge {
                size: bytes.len(),
                max: self.config.max_log_size,
            });
        }

        let timestamp = self.clock.now_millis().max(fragments.active.timestamp() + 1);
        fragments.standby.rewrite(timestamp, &bytes)?;
        fragments.active.set_state(CLEAN_STATE)?;
        fragments.active.sync()?;

        std::mem::swap(&mut fragments.active, &mut fragments.standby);
        tracing::info!(
            "journal swapped to {}, {} dangling record(s) copied",
            fragments.active.path().display(),
            dangling.len()
        );
        Ok(())
    }

    fn sync_active(&self) -> Result<()> {
        let (file, path) = {
            let guard = self.fragments.lock();
            let fragments = guard.as_ref().ok_or(JournalError::NotOpen)?;
            (fragments.active.handle(), fragments.active.path().to_path_buf())
        };
        file.sync_data().map_err(|e| JournalError::io(path, e))
    }
}

impl Journal for DiskJournal {
    fn open(&self) -> Result<()> {
        let mut guard = self.fragments.lock();
        if guard.is_some() {
            tracing::warn!("disk journal is already open");
            return Ok(());
        }

        let part1 = Fragment::open(&self.config.part1, self.config.max_log_size)?;
        let part2 = Fragment::open(&self.config.part2, self.config.max_log_size)?;

        let (mut active, standby) = if part2.timestamp() > part1.timestamp() {
            (part2, part1)
        } else {
            (part1, part2)
        };

        if active.timestamp() == 0 {
            active.set_timestamp(self.clock.now_millis())?;
        } else if active.state() == UNCLEAN_STATE {
            tracing::warn!(
                "journal fragment {} was not closed cleanly",
                active.path().display()
            );
        }

        // Validate existing content before accepting new records
        let records = active.read_records(self.config.skip_corrupted_logs)?;
        if let Some(last) = records.iter().map(|record| record.sequence).max() {
            self.sequence.store(last.wrapping_add(1), Ordering::Relaxed);
        }

        active.set_state(UNCLEAN_STATE)?;
        active.sync()?;

        tracing::info!(
            "disk journal opened, active fragment {} with {} record(s)",
            active.path().display(),
            records.len()
        );
        *guard = Some(Fragments { active, standby });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let Some(mut fragments) = self.fragments.lock().take() else {
            return Ok(());
        };
        fragments.active.set_state(CLEAN_STATE)?;
        fragments.active.sync()?;
        fragments.standby.sync()?;
        tracing::info!("disk journal closed");
        Ok(())
    }

    fn log(&self, status: Status, gtrid: &Uid, unique_names: &BTreeSet<String>) -> Result<()> {
        let record = JournalRecord::new(
            status,
            gtrid.clone(),
            unique_names.clone(),
            self.clock.now_millis(),
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );
        let bytes = encode_record(&record).map_err(JournalError::Failed)?;

        let mut guard = self.fragments.lock();
        let fragments = guard.as_mut().ok_or(JournalError::NotOpen)?;

        if fragments.active.position() + bytes.len() as u64 > self.config.max_log_size {
            self.swap(fragments)?;
            if fragments.active.position() + bytes.len() as u64 > self.config.max_log_size {
                return Err(JournalError::RecordTooLarge {
                    size: bytes.len(),
                    max: self.config.max_log_size,
                });
            }
        }

        tracing::trace!("journaling {}", record);
        fragments.active.append(&bytes)
    }

    fn force(&self) -> Result<()> {
        if !self.config.forced_write_enabled {
            return Ok(());
        }
        if self.config.force_batching_enabled {
            self.batcher.force(|| self.sync_active())
        } else {
            self.sync_active()
        }
    }

    fn collect_dangling_records(&self) -> Result<HashMap<Uid, JournalRecord>> {
        Ok(collect_dangling(self.read_active_records()?))
    }
}

impl Drop for DiskJournal {
    fn drop(&mut self) {
        if self.is_open() {
            self.shutdown();
        }
    }
}
