//! In-memory journal implementation

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tandem_journal::{Journal, JournalError, JournalRecord, Result, collect_dangling};
use tandem_uid::{MonotonicClock, Uid};
use tandem_xa::Status;

/// In-memory journal for testing and embedded use.
///
/// Records survive a close/open cycle of the same instance, which is enough
/// to exercise recovery without touching the filesystem.
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
    open: AtomicBool,
    failing: AtomicBool,
    forces: AtomicUsize,
    sequence: AtomicU32,
    clock: Arc<MonotonicClock>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            forces: AtomicUsize::new(0),
            sequence: AtomicU32::new(0),
            clock: MonotonicClock::global(),
        }
    }

    /// Every record logged so far, oldest first.
    pub fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().clone()
    }

    /// Statuses logged for one transaction, oldest first.
    pub fn statuses_for(&self, gtrid: &Uid) -> Vec<Status> {
        self.records
            .lock()
            .iter()
            .filter(|record| &record.gtrid == gtrid)
            .map(|record| record.status)
            .collect()
    }

    /// Number of `force` calls.
    pub fn force_count(&self) -> usize {
        self.forces.load(Ordering::Relaxed)
    }

    /// Make subsequent writes fail, simulating an unusable storage device.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Append a record as if it had been logged by a previous run.
    pub fn inject(&self, record: JournalRecord) {
        self.records.lock().push(record);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn check_writable(&self) -> Result<()> {
        if !self.is_open() {
            return Err(JournalError::NotOpen);
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(JournalError::Failed("memory journal set to fail".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal for MemoryJournal {
    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn log(&self, status: Status, gtrid: &Uid, unique_names: &BTreeSet<String>) -> Result<()> {
        self.check_writable()?;
        let record = JournalRecord::new(
            status,
            gtrid.clone(),
            unique_names.clone(),
            self.clock.now_millis(),
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );
        self.records.lock().push(record);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        self.check_writable()?;
        self.forces.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn collect_dangling_records(&self) -> Result<HashMap<Uid, JournalRecord>> {
        if !self.is_open() {
            return Err(JournalError::NotOpen);
        }
        Ok(collect_dangling(self.records.lock().iter().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_and_collect() {
        let journal = MemoryJournal::new();
        let gtrid = Uid::from_parts(b"mem", 1, 1);
        let names: BTreeSet<String> = ["a".to_string()].into();

        // Closed journal refuses writes
        assert!(journal.log(Status::Active, &gtrid, &names).is_err());

        journal.open().unwrap();
        journal.log(Status::Committing, &gtrid, &names).unwrap();
        journal.force().unwrap();
        assert_eq!(journal.collect_dangling_records().unwrap().len(), 1);

        journal.log(Status::Committed, &gtrid, &names).unwrap();
        assert!(journal.collect_dangling_records().unwrap().is_empty());
        assert_eq!(
            journal.statuses_for(&gtrid),
            vec![Status::Committing, Status::Committed]
        );
        assert_eq!(journal.force_count(), 1);
    }

    #[test]
    fn test_failing_journal() {
        let journal = MemoryJournal::new();
        journal.open().unwrap();
        journal.set_failing(true);
        let err = journal
            .log(Status::Active, &Uid::from_parts(b"mem", 1, 1), &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, JournalError::Failed(_)));
    }
}
