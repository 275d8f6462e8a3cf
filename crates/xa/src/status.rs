//! Transaction status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Global transaction status.
///
/// Numeric codes follow the classic transaction status constants so journal
/// files stay readable by tools that know them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Active,
    MarkedRollback,
    Prepared,
    Committed,
    RolledBack,
    /// Outcome could not be determined (heuristic or unreachable branches)
    Unknown,
    NoTransaction,
    Preparing,
    Committing,
    RollingBack,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Active => 0,
            Status::MarkedRollback => 1,
            Status::Prepared => 2,
            Status::Committed => 3,
            Status::RolledBack => 4,
            Status::Unknown => 5,
            Status::NoTransaction => 6,
            Status::Preparing => 7,
            Status::Committing => 8,
            Status::RollingBack => 9,
        }
    }

    pub fn from_code(code: i32) -> Option<Status> {
        Some(match code {
            0 => Status::Active,
            1 => Status::MarkedRollback,
            2 => Status::Prepared,
            3 => Status::Committed,
            4 => Status::RolledBack,
            5 => Status::Unknown,
            6 => Status::NoTransaction,
            7 => Status::Preparing,
            8 => Status::Committing,
            9 => Status::RollingBack,
            _ => return None,
        })
    }

    /// No transition is possible out of a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Committed | Status::RolledBack | Status::Unknown
        )
    }

    /// Completion (prepare, commit or rollback) has started or finished.
    pub fn is_finishing(self) -> bool {
        matches!(
            self,
            Status::Preparing
                | Status::Prepared
                | Status::Committing
                | Status::RollingBack
        ) || self.is_terminal()
    }

    /// Whether `self -> next` is a legal transition. Self-transitions never are.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (NoTransaction, Active)
                | (Active, MarkedRollback)
                | (Active, Preparing)
                | (Active, Committing)
                | (Active, RollingBack)
                | (MarkedRollback, RollingBack)
                | (Preparing, Prepared)
                | (Preparing, RollingBack)
                | (Prepared, Committing)
                | (Prepared, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (Committing, Unknown)
                | (RollingBack, RolledBack)
                | (RollingBack, Unknown)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Active => "ACTIVE",
            Status::MarkedRollback => "MARKED_ROLLBACK",
            Status::Prepared => "PREPARED",
            Status::Committed => "COMMITTED",
            Status::RolledBack => "ROLLEDBACK",
            Status::Unknown => "UNKNOWN",
            Status::NoTransaction => "NO_TRANSACTION",
            Status::Preparing => "PREPARING",
            Status::Committing => "COMMITTING",
            Status::RollingBack => "ROLLING_BACK",
        };
        f.write_str(name)
    }
}
