use std::collections::BTreeSet;
use tandem_journal_disk::{DiskJournal, DiskJournalConfig};
use tandem_uid::Uid;
use tempfile::TempDir;

pub fn setup(max_log_size: u64) -> (TempDir, DiskJournalConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = DiskJournalConfig::in_directory(dir.path())
        .with_max_log_size(max_log_size)
        .with_force_batching(false);
    (dir, config)
}

pub fn open(config: &DiskJournalConfig) -> DiskJournal {
    use tandem_journal::Journal;
    let journal = DiskJournal::new(config.clone());
    journal.open().unwrap();
    journal
}

pub fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

pub fn gtrid(sequence: u32) -> Uid {
    Uid::from_parts(b"disk-test", 1_000, sequence)
}
