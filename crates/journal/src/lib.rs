//! Transaction journal abstraction
//!
//! A journal records status transitions of global transactions so that the
//! recoverer can tell, after a crash, which in-doubt branches must be
//! committed. Implementations live in `tandem-journal-disk` and
//! `tandem-journal-memory`.

mod error;
mod record;

pub use error::{JournalError, Result};
pub use record::{JournalRecord, collect_dangling};

use std::collections::{BTreeSet, HashMap};
use tandem_uid::Uid;
use tandem_xa::Status;

/// Durable log of transaction status transitions.
pub trait Journal: Send + Sync {
    /// Open the journal, validating whatever is already stored.
    fn open(&self) -> Result<()>;

    /// Flush and close the journal.
    fn close(&self) -> Result<()>;

    /// Close the journal, logging instead of returning failures.
    fn shutdown(&self) {
        if let Err(e) = self.close() {
            tracing::error!("error shutting down journal: {}", e);
        }
    }

    /// Append a status transition.
    fn log(&self, status: Status, gtrid: &Uid, unique_names: &BTreeSet<String>) -> Result<()>;

    /// Make every record logged so far durable.
    fn force(&self) -> Result<()>;

    /// Transactions with a COMMITTING record whose resources have not all
    /// been confirmed as completed.
    fn collect_dangling_records(&self) -> Result<HashMap<Uid, JournalRecord>>;
}

/// Journal that records nothing. Recovery always presumes abort.
#[derive(Debug, Default)]
pub struct NullJournal;

impl NullJournal {
    pub fn new() -> Self {
        Self
    }
}

impl Journal for NullJournal {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn log(&self, _status: Status, _gtrid: &Uid, _unique_names: &BTreeSet<String>) -> Result<()> {
        Ok(())
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn collect_dangling_records(&self) -> Result<HashMap<Uid, JournalRecord>> {
        Ok(HashMap::new())
    }
}
