//! Two-phase commit transaction manager
//!
//! A [`TransactionManager`] coordinates atomic updates across independently
//! failing XA resources. Each [`TransactionContext`] drives at most one
//! [`Transaction`] at a time through begin, enlistment and completion.
//! Status transitions are written to a journal before they take effect, and
//! the [`Recoverer`] uses it after a crash to commit or roll back branches
//! left in-doubt.
//!
//! Resources are registered as [`XaResourceProducer`]s, usually a
//! [`PoolingProducer`] wrapping a connection pool.

pub mod config;
pub mod error;
pub mod executor;
pub mod manager;
pub mod observer;
pub mod producer;
pub mod recoverer;
pub mod registrar;
pub mod resource_manager;
pub mod services;
pub mod synchronization;
pub mod timer;
pub mod transaction;

pub use config::{Configuration, JournalKind};
pub use error::{HeuristicOutcome, Phase, Result, TransactionError};
pub use executor::PhaseExecutor;
pub use manager::{SuspendedTransaction, TransactionContext, TransactionManager};
pub use observer::{TransactionInfo, TransactionObserver};
pub use producer::{PoolingProducer, TransactionalConnection};
pub use recoverer::{RecoveryReport, Recoverer};
pub use registrar::{Registrar, XaResourceProducer};
pub use resource_manager::{Enlistment, XaResourceManager};
pub use synchronization::Synchronization;
pub use transaction::Transaction;
