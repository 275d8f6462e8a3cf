mod common;

use common::{gtrid, names, open, setup};
use std::fs;
use tandem_journal::{Journal, JournalError};
use tandem_journal_disk::{CLEAN_STATE, HEADER_LEN, decode_record};
use tandem_xa::Status;

#[test]
fn test_dangling_records_survive_reopen() {
    let (_dir, config) = setup(64 * 1024);

    let journal = open(&config);
    let committed = gtrid(1);
    let in_doubt = gtrid(2);

    journal.log(Status::Active, &committed, &names(&[])).unwrap();
    journal
        .log(Status::Committing, &committed, &names(&["db", "mq"]))
        .unwrap();
    journal
        .log(Status::Committed, &committed, &names(&["db", "mq"]))
        .unwrap();
    journal
        .log(Status::Committing, &in_doubt, &names(&["db", "mq"]))
        .unwrap();
    journal.log(Status::Committed, &in_doubt, &names(&["db"])).unwrap();
    journal.force().unwrap();
    journal.close().unwrap();
    assert!(!journal.is_open());

    let reopened = open(&config);
    let dangling = reopened.collect_dangling_records().unwrap();
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[&in_doubt].unique_names, names(&["mq"]));
    assert_eq!(reopened.read_active_records().unwrap().len(), 5);
}

#[test]
fn test_swap_keeps_only_dangling_records() {
    // Small fragments force several swaps
    let (_dir, config) = setup(1024);
    let journal = open(&config);

    let in_doubt = gtrid(0);
    journal
        .log(Status::Committing, &in_doubt, &names(&["db"]))
        .unwrap();

    for i in 1..100 {
        let tx = gtrid(i);
        journal.log(Status::Committing, &tx, &names(&["db"])).unwrap();
        journal.log(Status::Committed, &tx, &names(&["db"])).unwrap();
    }
    journal.force().unwrap();

    let dangling = journal.collect_dangling_records().unwrap();
    assert_eq!(dangling.len(), 1);
    assert!(dangling.contains_key(&in_doubt));

    // The active fragment never grows past the limit
    let records = journal.read_active_records().unwrap();
    assert!(records.len() < 40);
    journal.close().unwrap();

    let reopened = open(&config);
    assert!(reopened.collect_dangling_records().unwrap().contains_key(&in_doubt));
}

#[test]
fn test_record_larger_than_fragment_is_refused() {
    let (_dir, config) = setup(128);
    let journal = open(&config);

    let many: Vec<String> = (0..20).map(|i| format!("resource-{}", i)).collect();
    let many: Vec<&str> = many.iter().map(String::as_str).collect();
    let err = journal
        .log(Status::Committing, &gtrid(1), &names(&many))
        .unwrap_err();
    assert!(matches!(err, JournalError::RecordTooLarge { .. }));
}

fn corrupt_second_record(config: &tandem_journal_disk::DiskJournalConfig) {
    let mut bytes = fs::read(&config.part1).unwrap();
    let (_, first_size) = decode_record(&bytes[HEADER_LEN as usize..]).unwrap();
    let target = HEADER_LEN as usize + first_size + 12;
    bytes[target] ^= 0xFF;
    fs::write(&config.part1, bytes).unwrap();
}

#[test]
fn test_corrupted_record_fails_open() {
    let (_dir, config) = setup(64 * 1024);
    let journal = open(&config);
    journal.log(Status::Committing, &gtrid(1), &names(&["db"])).unwrap();
    journal.log(Status::Committing, &gtrid(2), &names(&["db"])).unwrap();
    journal.close().unwrap();

    corrupt_second_record(&config);

    let strict = tandem_journal_disk::DiskJournal::new(config.clone());
    let err = strict.open().unwrap_err();
    assert!(matches!(err, JournalError::Corrupted { .. }));
}

#[test]
fn test_corrupted_record_is_skipped_when_configured() {
    let (_dir, config) = setup(64 * 1024);
    let journal = open(&config);
    journal.log(Status::Committing, &gtrid(1), &names(&["db"])).unwrap();
    journal.log(Status::Committing, &gtrid(2), &names(&["db"])).unwrap();
    journal.close().unwrap();

    corrupt_second_record(&config);

    let lenient = open(&config.clone().with_skip_corrupted_logs(true));
    let dangling = lenient.collect_dangling_records().unwrap();
    assert_eq!(dangling.len(), 1);
    assert!(dangling.contains_key(&gtrid(1)));

    // New records land where the corrupted one was
    lenient.log(Status::Committing, &gtrid(3), &names(&["db"])).unwrap();
    assert_eq!(lenient.collect_dangling_records().unwrap().len(), 2);
}

#[test]
fn test_clean_close_marks_header() {
    let (_dir, config) = setup(4096);
    let journal = open(&config);
    journal.close().unwrap();

    let bytes = fs::read(&config.part1).unwrap();
    assert_eq!(bytes[12], CLEAN_STATE);
}

#[test]
fn test_closed_journal_refuses_writes() {
    let (_dir, config) = setup(4096);
    let journal = tandem_journal_disk::DiskJournal::new(config);
    let err = journal
        .log(Status::Active, &gtrid(1), &names(&[]))
        .unwrap_err();
    assert!(matches!(err, JournalError::NotOpen));
}
