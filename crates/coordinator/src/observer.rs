//! Management view of transactions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tandem_uid::Uid;
use tandem_xa::Status;

/// Snapshot of one transaction for management tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub gtrid: Uid,
    pub status: Status,
    pub start_date: DateTime<Utc>,
    /// Execution context currently owning the transaction
    pub owner: Option<u64>,
    pub enlisted_resources: Vec<String>,
    pub timeout_ms: u64,
}

/// Receives transaction lifecycle events. Every method defaults to a no-op.
///
/// Called synchronously from the transaction's own task; implementations
/// must return quickly.
pub trait TransactionObserver: Send + Sync {
    fn transaction_started(&self, _info: &TransactionInfo) {}

    fn status_changed(&self, _gtrid: &Uid, _from: Status, _to: Status) {}

    fn transaction_completed(&self, _info: &TransactionInfo) {}
}
