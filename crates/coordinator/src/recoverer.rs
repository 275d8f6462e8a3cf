//! Crash recovery
//!
//! Every registered resource is asked for its in-doubt branches. A branch is
//! committed when the journal holds a dangling COMMITTING record for its
//! GTRID naming that resource; every other branch is rolled back (presumed
//! abort).

use crate::error::{Phase, Result, TransactionError};
use crate::registrar::XaResourceProducer;
use crate::services::Services;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tandem_journal::JournalRecord;
use tandem_pool::PoolRecoveryHook;
use tandem_uid::Uid;
use tandem_xa::flags::{TMENDRSCAN, TMNOFLAGS, TMSTARTRSCAN};
use tandem_xa::{HeuristicKind, Status, XaError, XaResource, Xid};
use tokio::sync::Mutex as AsyncMutex;

/// Outcome of one recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub started_at: DateTime<Utc>,
    /// In-doubt branches committed
    pub committed: usize,
    /// In-doubt branches rolled back
    pub rolled_back: usize,
    /// Branches that reported a heuristic outcome and were forgotten
    pub heuristics: usize,
    /// Error per resource whose recovery failed
    pub failures: BTreeMap<String, String>,
}

impl RecoveryReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            committed: 0,
            rolled_back: 0,
            heuristics: 0,
            failures: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Resets the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Resolves in-doubt branches left by crashed or failed transactions.
pub struct Recoverer {
    services: Arc<Services>,
    running: AtomicBool,
    /// Serializes full and incremental runs
    scan_lock: AsyncMutex<()>,
    last_report: Mutex<Option<RecoveryReport>>,
    executions: AtomicU64,
}

impl Recoverer {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            running: AtomicBool::new(false),
            scan_lock: AsyncMutex::new(()),
            last_report: Mutex::new(None),
            executions: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of completed full runs.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Acquire)
    }

    pub fn last_report(&self) -> Option<RecoveryReport> {
        self.last_report.lock().clone()
    }

    /// Recover every registered resource.
    ///
    /// A run already in progress makes this call fail immediately. One
    /// resource failing does not stop the others from being recovered.
    pub async fn run(&self) -> Result<RecoveryReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransactionError::IllegalState(
                "recovery is already running".to_string(),
            ));
        }
        let _running = RunGuard(&self.running);
        let _scan = self.scan_lock.lock().await;

        let producers = self.services.registrar.producers();
        tracing::info!("starting recovery of {} resource(s)", producers.len());
        let report = self.recover_producers(&producers).await?;

        self.executions.fetch_add(1, Ordering::AcqRel);
        *self.last_report.lock() = Some(report.clone());
        tracing::info!(
            "recovery committed {} and rolled back {} branch(es), {} resource(s) failed",
            report.committed,
            report.rolled_back,
            report.failures.len()
        );
        Ok(report)
    }

    /// Recover a single resource, e.g. right after it got registered.
    pub async fn recover_resource(&self, unique_name: &str) -> Result<RecoveryReport> {
        let producer = self.services.registrar.get(unique_name).ok_or_else(|| {
            TransactionError::IllegalState(format!(
                "cannot recover unregistered resource {}",
                unique_name
            ))
        })?;

        let _scan = self.scan_lock.lock().await;
        tracing::debug!("incremental recovery of {}", unique_name);
        self.recover_producers(&[producer]).await
    }

    async fn recover_producers(
        &self,
        producers: &[Arc<dyn XaResourceProducer>],
    ) -> Result<RecoveryReport> {
        let dangling = self.services.journal.collect_dangling_records()?;
        let mut report = RecoveryReport::new();
        let mut recovered = BTreeSet::new();

        for producer in producers {
            let name = producer.unique_name().to_string();
            match self.recover_producer(producer.as_ref(), &dangling, &mut report).await {
                Ok(()) => {
                    recovered.insert(name);
                }
                Err(e) => {
                    tracing::warn!("error recovering resource {}: {}", name, e);
                    if producer.config().ignore_recovery_failures {
                        tracing::info!("ignoring recovery failure of {}", name);
                    } else {
                        producer.set_failed(true);
                    }
                    report.failures.insert(name, e.to_string());
                }
            }
        }

        self.log_resolved(&dangling, &recovered)?;
        Ok(report)
    }

    async fn recover_producer(
        &self,
        producer: &dyn XaResourceProducer,
        dangling: &HashMap<Uid, JournalRecord>,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let name = producer.unique_name();
        let xa_resource = producer
            .start_recovery()
            .await
            .map_err(|e| TransactionError::resource(Phase::Recovery, name, e))?;

        let result = self
            .recover_xa_resource(name, xa_resource.as_ref(), dangling, report)
            .await;

        if let Err(e) = producer.end_recovery().await {
            tracing::warn!("error ending recovery of {}: {}", name, e);
        }
        result
    }

    async fn recover_xa_resource(
        &self,
        name: &str,
        xa_resource: &dyn XaResource,
        dangling: &HashMap<Uid, JournalRecord>,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let xids = scan(xa_resource)
            .await
            .map_err(|e| TransactionError::resource(Phase::Recovery, name, e))?;

        let mut first_error = None;
        for xid in xids {
            if !self.is_recoverable(&xid) {
                continue;
            }

            let commit = dangling
                .get(xid.gtrid())
                .is_some_and(|record| record.unique_names.contains(name));
            let result = if commit {
                tracing::info!("committing in-doubt branch {} on {}", xid, name);
                xa_resource.commit(&xid, false).await
            } else {
                tracing::info!("rolling back in-doubt branch {} on {}", xid, name);
                xa_resource.rollback(&xid).await
            };

            match result {
                Ok(()) if commit => report.committed += 1,
                Ok(()) => report.rolled_back += 1,
                Err(e) if e.is_not_a() || (!commit && e.is_rollback()) => {
                    tracing::debug!("branch {} on {} is already resolved: {}", xid, name, e);
                }
                Err(e) => match e.heuristic() {
                    Some(kind) => {
                        let expected = if commit {
                            HeuristicKind::Commit
                        } else {
                            HeuristicKind::Rollback
                        };
                        if kind != expected {
                            tracing::error!(
                                "heuristic {:?} on {} while recovering {}: {}",
                                kind,
                                name,
                                xid,
                                e
                            );
                        }
                        report.heuristics += 1;
                        if let Err(e) = xa_resource.forget(&xid).await {
                            tracing::error!("cannot forget {} on {}: {}", xid, name, e);
                        }
                    }
                    None => {
                        tracing::warn!("error resolving {} on {}: {}", xid, name, e);
                        first_error.get_or_insert(e);
                    }
                },
            }
        }

        match first_error {
            Some(e) => Err(TransactionError::resource(Phase::Recovery, name, e)),
            None => Ok(()),
        }
    }

    fn is_recoverable(&self, xid: &Xid) -> bool {
        if !xid.is_ours() {
            tracing::debug!("skipping branch {} with foreign format id", xid);
            return false;
        }
        if self.services.config.current_node_only_recovery
            && xid.gtrid().extract_server_id() != Some(self.services.uid_generator.server_id())
        {
            tracing::debug!("skipping branch {} of another node", xid);
            return false;
        }
        if self.services.is_in_flight(xid.gtrid()) {
            tracing::debug!("skipping branch {} of a transaction in flight", xid);
            return false;
        }
        true
    }

    /// Journal COMMITTED for dangling transactions whose resources all recovered.
    fn log_resolved(
        &self,
        dangling: &HashMap<Uid, JournalRecord>,
        recovered: &BTreeSet<String>,
    ) -> Result<()> {
        let journal = &self.services.journal;
        let mut logged = 0;
        for (gtrid, record) in dangling {
            if self.services.is_in_flight(gtrid) || !record.unique_names.is_subset(recovered) {
                continue;
            }
            journal.log(Status::Committed, gtrid, &record.unique_names)?;
            logged += 1;
        }
        if logged > 0 {
            journal.force()?;
            tracing::debug!("marked {} dangling transaction(s) as committed", logged);
        }
        Ok(())
    }
}

/// Every in-doubt XID of a resource, over a full recovery scan.
async fn scan(xa_resource: &dyn XaResource) -> std::result::Result<Vec<Xid>, XaError> {
    let mut seen = HashSet::new();
    let mut xids = Vec::new();
    let mut flags = TMSTARTRSCAN;
    loop {
        let batch = xa_resource.recover(flags).await?;
        flags = TMNOFLAGS;
        let before = xids.len();
        for xid in batch {
            if seen.insert(xid.clone()) {
                xids.push(xid);
            }
        }
        if xids.len() == before {
            break;
        }
    }
    if let Err(e) = xa_resource.recover(TMENDRSCAN).await {
        tracing::debug!("error ending recovery scan: {}", e);
    }
    Ok(xids)
}

/// Lets a failed pool re-run recovery of its resource after a reset.
pub struct RecoveryHook {
    recoverer: Weak<Recoverer>,
}

impl RecoveryHook {
    pub fn new(recoverer: &Arc<Recoverer>) -> Self {
        Self {
            recoverer: Arc::downgrade(recoverer),
        }
    }
}

#[async_trait]
impl PoolRecoveryHook for RecoveryHook {
    async fn recover_pool(&self, unique_name: &str) -> std::result::Result<(), String> {
        let recoverer = self
            .recoverer
            .upgrade()
            .ok_or_else(|| "transaction manager is shut down".to_string())?;
        let report = recoverer
            .recover_resource(unique_name)
            .await
            .map_err(|e| e.to_string())?;
        match report.failures.get(unique_name) {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }
}
