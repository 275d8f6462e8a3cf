//! Shared collaborators of one transaction manager instance

use crate::config::Configuration;
use crate::error::{Result, TransactionError};
use crate::executor::PhaseExecutor;
use crate::observer::TransactionObserver;
use crate::registrar::Registrar;
use crate::timer::TaskScheduler;
use crate::transaction::Transaction;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_journal::{Journal, JournalError};
use tandem_uid::{Uid, UidGenerator};

/// Everything a transaction needs from its manager, built once at startup.
pub struct Services {
    pub config: Configuration,
    pub uid_generator: Arc<UidGenerator>,
    pub journal: Arc<dyn Journal>,
    pub registrar: Registrar,
    pub executor: PhaseExecutor,
    pub tasks: TaskScheduler,
    in_flight: Mutex<HashMap<Uid, Arc<Transaction>>>,
    observer: RwLock<Option<Arc<dyn TransactionObserver>>>,
    journal_failed: AtomicBool,
    shutting_down: AtomicBool,
}

impl Services {
    pub fn new(config: Configuration, journal: Arc<dyn Journal>) -> Result<Self> {
        config.validate()?;
        let uid_generator = UidGenerator::new(&config.server_id)
            .map_err(|e| TransactionError::Configuration(e.to_string()))?;
        let executor = if config.asynchronous_2pc {
            PhaseExecutor::parallel(config.max_async_workers)
        } else {
            PhaseExecutor::sequential()
        };

        Ok(Self {
            config,
            uid_generator: Arc::new(uid_generator),
            journal,
            registrar: Registrar::new(),
            executor,
            tasks: TaskScheduler::new(),
            in_flight: Mutex::new(HashMap::new()),
            observer: RwLock::new(None),
            journal_failed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn observer(&self) -> Option<Arc<dyn TransactionObserver>> {
        self.observer.read().clone()
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn TransactionObserver>>) {
        *self.observer.write() = observer;
    }

    /// Once the journal failed no new transaction may start.
    pub fn mark_journal_failed(&self, error: &JournalError) {
        if !self.journal_failed.swap(true, Ordering::AcqRel) {
            tracing::error!(
                "journal failure, refusing new transactions until restart: {}",
                error
            );
        }
    }

    pub fn is_journal_failed(&self) -> bool {
        self.journal_failed.load(Ordering::Acquire)
    }

    /// Returns whether shutdown had already started.
    pub fn set_shutting_down(&self) -> bool {
        self.shutting_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn add_in_flight(&self, tx: Arc<Transaction>) {
        self.in_flight.lock().insert(tx.gtrid().clone(), tx);
    }

    pub(crate) fn remove_in_flight(&self, gtrid: &Uid) -> Option<Arc<Transaction>> {
        self.in_flight.lock().remove(gtrid)
    }

    pub fn is_in_flight(&self, gtrid: &Uid) -> bool {
        self.in_flight.lock().contains_key(gtrid)
    }

    pub fn in_flight(&self) -> Vec<Arc<Transaction>> {
        self.in_flight.lock().values().cloned().collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub(crate) fn clear_in_flight(&self) -> usize {
        let mut in_flight = self.in_flight.lock();
        let count = in_flight.len();
        in_flight.clear();
        count
    }
}
