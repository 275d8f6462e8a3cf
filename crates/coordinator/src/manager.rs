//! Transaction manager and execution contexts

use crate::config::{Configuration, JournalKind};
use crate::error::{Result, TransactionError};
use crate::observer::{TransactionInfo, TransactionObserver};
use crate::recoverer::{Recoverer, RecoveryHook, RecoveryReport};
use crate::registrar::XaResourceProducer;
use crate::services::Services;
use crate::transaction::Transaction;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tandem_journal::{Journal, NullJournal};
use tandem_journal_disk::DiskJournal;
use tandem_journal_memory::MemoryJournal;
use tandem_pool::PoolStatistics;
use tandem_uid::Uid;
use tandem_xa::Status;
use tokio::time::Instant;

/// Entry point: owns the journal, the registered resources and the
/// background tasks, and hands out [`TransactionContext`]s.
pub struct TransactionManager {
    services: Arc<Services>,
    recoverer: Arc<Recoverer>,
    next_context: AtomicU64,
}

impl TransactionManager {
    /// Start with the journal selected by the configuration.
    pub async fn start(config: Configuration) -> Result<Arc<Self>> {
        config.validate()?;
        let journal: Arc<dyn Journal> = match config.journal {
            JournalKind::Disk => Arc::new(DiskJournal::new(config.disk_journal_config())),
            JournalKind::Memory => Arc::new(MemoryJournal::new()),
            JournalKind::Null => Arc::new(NullJournal::new()),
        };
        Self::start_with_journal(config, journal).await
    }

    /// Open the journal, run startup recovery, then schedule background
    /// recovery and pool shrinking.
    pub async fn start_with_journal(
        config: Configuration,
        journal: Arc<dyn Journal>,
    ) -> Result<Arc<Self>> {
        let services = Arc::new(Services::new(config, journal)?);
        services.journal.open()?;

        let manager = Arc::new(Self {
            recoverer: Arc::new(Recoverer::new(services.clone())),
            services,
            next_context: AtomicU64::new(1),
        });

        if let Err(e) = manager.recoverer.run().await {
            manager.services.journal.shutdown();
            return Err(e);
        }
        manager.schedule_background_tasks();

        tracing::info!(
            "transaction manager {} started",
            manager.services.config.server_id
        );
        Ok(manager)
    }

    fn schedule_background_tasks(&self) {
        let config = &self.services.config;

        if !config.background_recovery_interval.is_zero() {
            let recoverer = Arc::downgrade(&self.recoverer);
            self.services.tasks.schedule_periodic(
                "background recovery",
                config.background_recovery_interval,
                move || {
                    let recoverer = recoverer.clone();
                    async move {
                        if let Some(recoverer) = recoverer.upgrade()
                            && let Err(e) = recoverer.run().await
                        {
                            tracing::warn!("background recovery failed: {}", e);
                        }
                    }
                },
            );
        }

        if !config.pool_shrink_interval.is_zero() {
            let services = Arc::downgrade(&self.services);
            self.services.tasks.schedule_periodic(
                "pool shrinker",
                config.pool_shrink_interval,
                move || {
                    let services = services.clone();
                    async move {
                        let Some(services) = services.upgrade() else {
                            return;
                        };
                        for producer in services.registrar.producers() {
                            producer.shrink().await;
                        }
                    }
                },
            );
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.services.config
    }

    /// A new execution context, owning at most one transaction at a time.
    pub fn context(self: &Arc<Self>) -> TransactionContext {
        TransactionContext {
            manager: self.clone(),
            id: self.next_context.fetch_add(1, Ordering::Relaxed),
            current: None,
            timeout: None,
        }
    }

    /// Register a resource and recover its in-doubt branches.
    pub async fn register_resource(
        &self,
        producer: Arc<dyn XaResourceProducer>,
    ) -> Result<RecoveryReport> {
        self.services.registrar.register(producer.clone())?;
        producer.set_recovery_hook(Arc::new(RecoveryHook::new(&self.recoverer)));
        self.recoverer.recover_resource(producer.unique_name()).await
    }

    pub fn unregister_resource(&self, unique_name: &str) -> Option<Arc<dyn XaResourceProducer>> {
        self.services.registrar.unregister(unique_name)
    }

    pub fn resource(&self, unique_name: &str) -> Option<Arc<dyn XaResourceProducer>> {
        self.services.registrar.get(unique_name)
    }

    /// Running transactions, oldest first.
    pub fn in_flight_transactions(&self) -> Vec<TransactionInfo> {
        let mut infos: Vec<TransactionInfo> = self
            .services
            .in_flight()
            .iter()
            .map(|tx| tx.info())
            .collect();
        infos.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.gtrid.cmp(&b.gtrid)));
        infos
    }

    pub fn in_flight_transaction(&self, gtrid: &Uid) -> Option<Arc<Transaction>> {
        self.services
            .in_flight()
            .into_iter()
            .find(|tx| tx.gtrid() == gtrid)
    }

    pub fn pool_statistics(&self) -> Vec<PoolStatistics> {
        self.services
            .registrar
            .producers()
            .iter()
            .filter_map(|producer| producer.statistics())
            .collect()
    }

    pub fn recoverer(&self) -> &Arc<Recoverer> {
        &self.recoverer
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn TransactionObserver>>) {
        self.services.set_observer(observer);
    }

    pub fn is_journal_failed(&self) -> bool {
        self.services.is_journal_failed()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.services.is_shutting_down()
    }

    /// Stop accepting transactions, wait for in-flight ones up to the
    /// graceful shutdown interval, then release everything.
    pub async fn shutdown(&self) {
        if self.services.set_shutting_down() {
            return;
        }
        tracing::info!("shutting down transaction manager");

        let grace = self.services.config.graceful_shutdown_interval;
        let deadline = Instant::now() + grace;
        loop {
            let in_flight = self.services.in_flight_count();
            if in_flight == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    "{} transaction(s) still in flight after {:?}, shutting down anyway",
                    in_flight,
                    grace
                );
                for tx in self.services.in_flight() {
                    tracing::warn!("abandoning {}", tx);
                }
                break;
            }
            tracing::debug!("waiting for {} in-flight transaction(s)", in_flight);
            tokio::time::sleep((deadline - now).min(Duration::from_millis(100))).await;
        }

        self.services.tasks.shutdown();
        for producer in self.services.registrar.producers() {
            producer.close().await;
        }
        self.services.journal.shutdown();
        self.services.clear_in_flight();
        tracing::info!("transaction manager shut down");
    }
}

/// A transaction detached from its context by [`TransactionContext::suspend`].
///
/// Not cloneable: it can be resumed in exactly one context.
pub struct SuspendedTransaction {
    tx: Arc<Transaction>,
}

impl SuspendedTransaction {
    pub fn gtrid(&self) -> &Uid {
        self.tx.gtrid()
    }

    pub fn status(&self) -> Status {
        self.tx.status()
    }
}

/// The single execution context driving a transaction.
pub struct TransactionContext {
    manager: Arc<TransactionManager>,
    id: u64,
    current: Option<Arc<Transaction>>,
    timeout: Option<Duration>,
}

impl TransactionContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The transaction this context currently drives.
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.current.clone()
    }

    pub fn status(&self) -> Status {
        self.current
            .as_ref()
            .map_or(Status::NoTransaction, |tx| tx.status())
    }

    /// Timeout of transactions begun afterwards; zero restores the default.
    pub fn set_transaction_timeout(&mut self, timeout: Duration) {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
    }

    pub fn begin(&mut self) -> Result<Arc<Transaction>> {
        let timeout = self
            .timeout
            .unwrap_or(self.manager.services.config.default_transaction_timeout);
        self.begin_with_timeout(timeout)
    }

    pub fn begin_with_timeout(&mut self, timeout: Duration) -> Result<Arc<Transaction>> {
        if let Some(current) = &self.current {
            return Err(TransactionError::NotSupported(format!(
                "nested transactions are not supported, {} is running",
                current.gtrid()
            )));
        }
        let services = &self.manager.services;
        if services.is_shutting_down() {
            return Err(TransactionError::IllegalState(
                "transaction manager is shutting down".to_string(),
            ));
        }
        if services.is_journal_failed() {
            return Err(TransactionError::IllegalState(
                "journal failed, no new transaction can start".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(TransactionError::IllegalState(
                "transaction timeout must be greater than 0".to_string(),
            ));
        }

        let tx = Transaction::begin(services.clone(), timeout, self.id)?;
        self.current = Some(tx.clone());
        Ok(tx)
    }

    fn take_current(&mut self) -> Result<Arc<Transaction>> {
        self.current.take().ok_or_else(|| {
            TransactionError::IllegalState("no transaction started on this context".to_string())
        })
    }

    /// Commit the current transaction. The context is free afterwards,
    /// whatever the outcome.
    pub async fn commit(&mut self) -> Result<()> {
        self.take_current()?.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.take_current()?.rollback().await
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        match &self.current {
            Some(tx) => tx.set_rollback_only(),
            None => Err(TransactionError::IllegalState(
                "no transaction started on this context".to_string(),
            )),
        }
    }

    /// Detach the current transaction, suspending its active branches.
    pub async fn suspend(&mut self) -> Result<Option<SuspendedTransaction>> {
        let Some(tx) = self.current.take() else {
            return Ok(None);
        };
        if let Err(e) = tx.suspend_branches().await {
            self.current = Some(tx);
            return Err(e);
        }
        tx.set_owner(None);
        tracing::debug!("context {} suspended {}", self.id, tx.gtrid());
        Ok(Some(SuspendedTransaction { tx }))
    }

    /// Attach a suspended transaction to this context and resume its branches.
    ///
    /// The transaction stays attached even when a branch fails to resume, so
    /// that it can still be rolled back.
    pub async fn resume(&mut self, suspended: SuspendedTransaction) -> Result<()> {
        if let Some(current) = &self.current {
            return Err(TransactionError::IllegalState(format!(
                "cannot resume {}, context already drives {}",
                suspended.gtrid(),
                current.gtrid()
            )));
        }
        let tx = suspended.tx;
        tx.set_owner(Some(self.id));
        self.current = Some(tx.clone());
        tx.resume_branches().await?;
        tracing::debug!("context {} resumed {}", self.id, tx.gtrid());
        Ok(())
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if let Some(tx) = self.current.take() {
            tracing::warn!(
                "context {} dropped while driving {}, rolling it back once it times out",
                self.id,
                tx.gtrid()
            );
            tx.abandon();
        }
    }
}
