//! Error types for the transaction manager

use std::fmt;
use tandem_journal::JournalError;
use tandem_pool::PoolError;
use tandem_xa::{HeuristicKind, XaError};
use thiserror::Error;

/// Phase of the transaction protocol a resource failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Enlist,
    Delist,
    Suspend,
    Resume,
    Prepare,
    Commit,
    Rollback,
    Recovery,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Enlist => "enlistment",
            Phase::Delist => "delistment",
            Phase::Suspend => "suspension",
            Phase::Resume => "resumption",
            Phase::Prepare => "prepare",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
            Phase::Recovery => "recovery",
        };
        f.write_str(name)
    }
}

/// Global outcome when branches did not all follow the coordinator's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeuristicOutcome {
    /// Every branch committed although rollback was decided
    Commit,
    /// Every branch rolled back although commit was decided
    Rollback,
    /// Some branches committed and others rolled back
    Mixed,
    /// Some branch outcomes are unknown
    Hazard,
}

impl From<HeuristicKind> for HeuristicOutcome {
    fn from(kind: HeuristicKind) -> Self {
        match kind {
            HeuristicKind::Commit => HeuristicOutcome::Commit,
            HeuristicKind::Rollback => HeuristicOutcome::Rollback,
            HeuristicKind::Mixed => HeuristicOutcome::Mixed,
            HeuristicKind::Hazard => HeuristicOutcome::Hazard,
        }
    }
}

impl fmt::Display for HeuristicOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeuristicOutcome::Commit => "commit",
            HeuristicOutcome::Rollback => "rollback",
            HeuristicOutcome::Mixed => "mixed",
            HeuristicOutcome::Hazard => "hazard",
        };
        f.write_str(name)
    }
}

/// Transaction manager errors
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Operation not allowed in the current state (commit without begin, ...)
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The transaction has been rolled back instead of committed
    #[error("Transaction rolled back: {message}")]
    RolledBack {
        message: String,
        #[source]
        cause: Option<Box<TransactionError>>,
    },

    /// Branches diverged from the decided outcome
    #[error("Heuristic {outcome}: {message}")]
    Heuristic {
        outcome: HeuristicOutcome,
        message: String,
    },

    /// Prepared branches were left for recovery to resolve
    #[error("Transaction {gtrid} left in-doubt: {message}")]
    InDoubt { gtrid: String, message: String },

    #[error("Transaction timed out: {0}")]
    TimedOut(String),

    /// A resource failed during one phase of the protocol
    #[error("{resource} failed during {phase}: {source}")]
    Resource {
        phase: Phase,
        resource: String,
        #[source]
        source: XaError,
    },

    #[error("System error: {0}")]
    System(String),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl TransactionError {
    pub(crate) fn rolled_back(message: impl Into<String>) -> Self {
        Self::RolledBack {
            message: message.into(),
            cause: None,
        }
    }

    pub(crate) fn rolled_back_by(message: impl Into<String>, cause: TransactionError) -> Self {
        Self::RolledBack {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub(crate) fn resource(phase: Phase, resource: &str, source: XaError) -> Self {
        Self::Resource {
            phase,
            resource: resource.to_string(),
            source,
        }
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }

    /// Heuristic outcome, if this error reports one.
    pub fn heuristic_outcome(&self) -> Option<HeuristicOutcome> {
        match self {
            Self::Heuristic { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }

    /// Errors after which the global outcome cannot be trusted without
    /// operator attention or recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Heuristic { .. } | Self::InDoubt { .. } | Self::Journal(_)
        )
    }
}

/// Result type for transaction manager operations
pub type Result<T> = std::result::Result<T, TransactionError>;
