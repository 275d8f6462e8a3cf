//! Journal records and dangling-record computation

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tandem_uid::Uid;
use tandem_xa::Status;

/// One status transition of one global transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub status: Status,
    pub gtrid: Uid,
    /// Unique names of the resources the transition concerns
    pub unique_names: BTreeSet<String>,
    /// Milliseconds since epoch, from the monotonic clock
    pub time: u64,
    /// Per-journal write sequence
    pub sequence: u32,
}

impl JournalRecord {
    pub fn new(
        status: Status,
        gtrid: Uid,
        unique_names: BTreeSet<String>,
        time: u64,
        sequence: u32,
    ) -> Self {
        Self {
            status,
            gtrid,
            unique_names,
            time,
            sequence,
        }
    }
}

impl fmt::Display for JournalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] at {} seq {}",
            self.status,
            self.gtrid,
            self.unique_names
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", "),
            self.time,
            self.sequence
        )
    }
}

/// Fold a record stream into the transactions whose commit is not known to
/// have reached every resource.
///
/// A COMMITTING record makes its resources dangling. A later COMMITTED,
/// ROLLEDBACK or UNKNOWN record resolves the resources it names; whatever is
/// left stays dangling. Other statuses are ignored.
pub fn collect_dangling<I>(records: I) -> HashMap<Uid, JournalRecord>
where
    I: IntoIterator<Item = JournalRecord>,
{
    let mut dangling: HashMap<Uid, JournalRecord> = HashMap::new();

    for record in records {
        match record.status {
            Status::Committing => match dangling.get_mut(&record.gtrid) {
                Some(existing) => {
                    existing
                        .unique_names
                        .extend(record.unique_names.iter().cloned());
                }
                None => {
                    dangling.insert(record.gtrid.clone(), record);
                }
            },
            Status::Committed | Status::RolledBack | Status::Unknown => {
                if let Some(existing) = dangling.get_mut(&record.gtrid) {
                    for name in &record.unique_names {
                        existing.unique_names.remove(name);
                    }
                    if existing.unique_names.is_empty() {
                        dangling.remove(&record.gtrid);
                    }
                }
            }
            _ => {}
        }
    }

    dangling
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn record(status: Status, gtrid: &Uid, list: &[&str]) -> JournalRecord {
        JournalRecord::new(status, gtrid.clone(), names(list), 1, 0)
    }

    #[test]
    fn test_committed_resolves_committing() {
        let tx = Uid::from_parts(b"srv", 1, 1);
        let dangling = collect_dangling(vec![
            record(Status::Active, &tx, &[]),
            record(Status::Committing, &tx, &["a", "b"]),
            record(Status::Committed, &tx, &["a", "b"]),
        ]);
        assert!(dangling.is_empty());
    }

    #[test]
    fn test_partial_resolution_leaves_remaining_names() {
        let tx = Uid::from_parts(b"srv", 1, 1);
        let other = Uid::from_parts(b"srv", 1, 2);
        let dangling = collect_dangling(vec![
            record(Status::Committing, &tx, &["a", "b"]),
            record(Status::Unknown, &tx, &["a"]),
            record(Status::Committing, &other, &["c"]),
        ]);

        assert_eq!(dangling.len(), 2);
        assert_eq!(dangling[&tx].unique_names, names(&["b"]));
        assert_eq!(dangling[&other].unique_names, names(&["c"]));
    }

    #[test]
    fn test_resolution_without_committing_is_ignored() {
        let tx = Uid::from_parts(b"srv", 1, 1);
        let dangling = collect_dangling(vec![
            record(Status::RolledBack, &tx, &["a"]),
            record(Status::Prepared, &tx, &["a"]),
        ]);
        assert!(dangling.is_empty());
    }
}
