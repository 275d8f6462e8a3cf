//! Global transaction state machine
//!
//! A transaction owns its branches through an [`XaResourceManager`] and
//! drives them through the 2PC executors. Every status change is journaled
//! before it becomes visible.

use crate::error::{Phase, Result, TransactionError};
use crate::executor::{Committer, Preparer, Rollbacker};
use crate::observer::TransactionInfo;
use crate::resource_manager::{Enlistment, XaResourceManager};
use crate::services::Services;
use crate::synchronization::Synchronization;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tandem_scheduler::Scheduler;
use tandem_uid::Uid;
use tandem_xa::flags::TMSUCCESS;
use tandem_xa::{BranchState, Status, XaResourceHolder, same_resource};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

struct TxState {
    status: Status,
    timed_out: bool,
    deadline: Instant,
    owner: Option<u64>,
    /// The owning context went away without completing the transaction
    abandoned: bool,
    enlisted: BTreeSet<String>,
}

/// One global transaction.
pub struct Transaction {
    gtrid: Uid,
    services: Arc<Services>,
    state: Mutex<TxState>,
    resource_manager: AsyncMutex<XaResourceManager>,
    synchronizations: Mutex<Scheduler<Arc<dyn Synchronization>>>,
    /// Held while completing; the timeout handler only flags the transaction
    /// when it can take it
    completion: AsyncMutex<()>,
    start_date: DateTime<Utc>,
    timeout: Duration,
}

impl Transaction {
    /// Start a new transaction and register it as in flight.
    pub(crate) fn begin(services: Arc<Services>, timeout: Duration, owner: u64) -> Result<Arc<Self>> {
        let gtrid = services.uid_generator.generate_uid();
        let tx = Arc::new(Self {
            resource_manager: AsyncMutex::new(XaResourceManager::new(
                gtrid.clone(),
                services.uid_generator.clone(),
            )),
            gtrid,
            state: Mutex::new(TxState {
                status: Status::NoTransaction,
                timed_out: false,
                deadline: Instant::now() + timeout,
                owner: Some(owner),
                abandoned: false,
                enlisted: BTreeSet::new(),
            }),
            synchronizations: Mutex::new(Scheduler::new()),
            completion: AsyncMutex::new(()),
            start_date: Utc::now(),
            timeout,
            services,
        });

        tx.change_status(Status::Active, &BTreeSet::new())?;
        tx.services.add_in_flight(tx.clone());
        tx.services.tasks.schedule_timeout(&tx);
        if let Some(observer) = tx.services.observer() {
            observer.transaction_started(&tx.info());
        }
        tracing::debug!("began transaction {} with timeout {:?}", tx.gtrid, timeout);
        Ok(tx)
    }

    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    pub(crate) fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    pub fn deadline(&self) -> Instant {
        self.state.lock().deadline
    }

    /// Time left before the transaction times out.
    pub fn remaining(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    pub fn is_timed_out(&self) -> bool {
        let state = self.state.lock();
        state.timed_out || Instant::now() >= state.deadline
    }

    pub fn owner(&self) -> Option<u64> {
        self.state.lock().owner
    }

    pub(crate) fn set_owner(&self, owner: Option<u64>) {
        self.state.lock().owner = owner;
    }

    /// Detach the transaction from a context that is going away.
    ///
    /// It is rolled back when it times out, or right away if it already has.
    pub(crate) fn abandon(self: &Arc<Self>) {
        let timed_out = {
            let mut state = self.state.lock();
            state.owner = None;
            state.abandoned = true;
            state.timed_out
        };
        if !timed_out {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let tx = self.clone();
                runtime.spawn(async move { tx.rollback_abandoned().await });
            }
            Err(_) => tracing::warn!(
                "no runtime to roll back abandoned transaction {}, it stays in flight",
                self.gtrid
            ),
        }
    }

    pub(crate) async fn rollback_abandoned(&self) {
        tracing::warn!("rolling back abandoned transaction {}", self.gtrid);
        if let Err(e) = self.rollback().await {
            tracing::error!("cannot roll back abandoned transaction {}: {}", self.gtrid, e);
        }
    }

    pub fn enlisted_resources(&self) -> Vec<String> {
        self.state.lock().enlisted.iter().cloned().collect()
    }

    pub fn info(&self) -> TransactionInfo {
        let state = self.state.lock();
        TransactionInfo {
            gtrid: self.gtrid.clone(),
            status: state.status,
            start_date: self.start_date,
            owner: state.owner,
            enlisted_resources: state.enlisted.iter().cloned().collect(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Journal and apply a status transition.
    ///
    /// Illegal transitions are refused. A journal failure leaves the status
    /// unchanged and stops the manager from starting new transactions.
    pub(crate) fn change_status(&self, status: Status, unique_names: &BTreeSet<String>) -> Result<()> {
        let previous = {
            let mut state = self.state.lock();
            let previous = state.status;
            if !previous.can_transition_to(status) {
                return Err(TransactionError::IllegalState(format!(
                    "cannot change status of {} from {} to {}",
                    self.gtrid, previous, status
                )));
            }

            self.journal(status, unique_names)?;
            state.status = status;
            previous
        };

        tracing::debug!("transaction {} changed from {} to {}", self.gtrid, previous, status);
        if let Some(observer) = self.services.observer() {
            observer.status_changed(&self.gtrid, previous, status);
        }
        Ok(())
    }

    fn journal(&self, status: Status, unique_names: &BTreeSet<String>) -> Result<()> {
        let config = &self.services.config;
        if config.filter_log_status
            && !matches!(status, Status::Committing | Status::Committed | Status::Unknown)
        {
            return Ok(());
        }

        let journal = &self.services.journal;
        let forced = config.forced_write_enabled
            && matches!(
                status,
                Status::Prepared | Status::Committing | Status::Committed | Status::RolledBack
            );
        journal
            .log(status, &self.gtrid, unique_names)
            .and_then(|_| if forced { journal.force() } else { Ok(()) })
            .map_err(|e| {
                self.services.mark_journal_failed(&e);
                TransactionError::Journal(e)
            })
    }

    /// Mark the transaction so that its only possible outcome is rollback.
    pub fn set_rollback_only(&self) -> Result<()> {
        match self.status() {
            Status::MarkedRollback => Ok(()),
            Status::Active => self.change_status(Status::MarkedRollback, &BTreeSet::new()),
            status => Err(TransactionError::IllegalState(format!(
                "cannot mark transaction {} as rollback only in status {}",
                self.gtrid, status
            ))),
        }
    }

    fn mark_rollback_only_quietly(&self) {
        if let Err(e) = self.set_rollback_only() {
            tracing::warn!("cannot mark transaction {} as rollback only: {}", self.gtrid, e);
        }
    }

    fn check_enlistable(&self) -> Result<()> {
        match self.status() {
            Status::Active => {}
            Status::MarkedRollback => {
                return Err(TransactionError::IllegalState(format!(
                    "transaction {} is marked as rollback only",
                    self.gtrid
                )));
            }
            status if status.is_finishing() => {
                return Err(TransactionError::IllegalState(format!(
                    "transaction {} is already completing with status {}",
                    self.gtrid, status
                )));
            }
            status => {
                return Err(TransactionError::IllegalState(format!(
                    "cannot enlist a resource in transaction {} with status {}",
                    self.gtrid, status
                )));
            }
        }

        if self.is_timed_out() {
            self.mark_rollback_only_quietly();
            return Err(TransactionError::TimedOut(format!(
                "transaction {} timed out after {:?}",
                self.gtrid, self.timeout
            )));
        }
        Ok(())
    }

    /// Start a branch for the holder's resource, or join an existing one.
    pub async fn enlist_resource(&self, holder: &Arc<dyn XaResourceHolder>) -> Result<Enlistment> {
        self.check_enlistable()?;

        let config = holder.resource_config();
        let unique_name = config.unique_name.as_str();
        if self.services.registrar.get(unique_name).is_none() {
            return Err(TransactionError::IllegalState(format!(
                "cannot enlist resource {}, it is not registered",
                unique_name
            )));
        }

        let state = Arc::new(BranchState::new(holder));
        let remaining = self.remaining();
        let enlistment = self
            .resource_manager
            .lock()
            .await
            .enlist(state.clone(), remaining)
            .await
            .map_err(|e| {
                if e.is_rollback() {
                    TransactionError::rolled_back(format!(
                        "resource {} rolled back its branch of {} on enlistment: {}",
                        unique_name, self.gtrid, e
                    ))
                } else {
                    TransactionError::resource(Phase::Enlist, unique_name, e)
                }
            })?;

        if let Enlistment::Started(xid) | Enlistment::Joined(xid) = &enlistment {
            holder.branch_states().put(xid, state);
        }
        self.state.lock().enlisted.insert(unique_name.to_string());
        tracing::debug!("enlisted {} in {}: {:?}", unique_name, self.gtrid, enlistment);
        Ok(enlistment)
    }

    /// End the holder's active branch with TMSUCCESS, TMFAIL or TMSUSPEND.
    ///
    /// A branch the resource already rolled back is reported as
    /// [`TransactionError::RolledBack`] and marks the transaction rollback only.
    pub async fn delist_resource(&self, holder: &Arc<dyn XaResourceHolder>, flags: i32) -> Result<()> {
        let xa_resource = holder.xa_resource();
        let unique_name = holder.resource_config().unique_name.clone();

        let result = {
            let mut resource_manager = self.resource_manager.lock().await;
            let state = resource_manager
                .all_states()
                .into_iter()
                .filter(|state| same_resource(state.xa_resource(), &xa_resource) && !state.is_ended())
                .max_by_key(|state| state.branch_age())
                .ok_or_else(|| {
                    TransactionError::IllegalState(format!(
                        "resource {} has no open branch in {}",
                        unique_name, self.gtrid
                    ))
                })?;
            resource_manager.delist(&state, flags).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_rollback() => {
                self.mark_rollback_only_quietly();
                Err(TransactionError::rolled_back(format!(
                    "resource {} unilaterally rolled back its branch of {}: {}",
                    unique_name, self.gtrid, e
                )))
            }
            Err(e) => Err(TransactionError::resource(Phase::Delist, &unique_name, e)),
        }
    }

    /// Register a callback run around completion, ordered by position.
    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
        position: i32,
    ) -> Result<()> {
        let status = self.status();
        if status != Status::Active {
            return Err(TransactionError::IllegalState(format!(
                "cannot register a synchronization in transaction {} with status {}",
                self.gtrid, status
            )));
        }
        self.synchronizations.lock().add(synchronization, position);
        Ok(())
    }

    /// Suspend every active branch before handing the transaction over.
    pub(crate) async fn suspend_branches(&self) -> Result<()> {
        self.resource_manager.lock().await.suspend().await
    }

    pub(crate) async fn resume_branches(&self) -> Result<()> {
        self.resource_manager.lock().await.resume().await
    }

    /// Flag the transaction as timed out unless it is already completing.
    ///
    /// Returns whether the transaction was abandoned and must now be rolled back.
    pub(crate) fn timeout_expired(&self) -> bool {
        let Ok(_completion) = self.completion.try_lock() else {
            tracing::debug!(
                "transaction {} timed out while completing, leaving it to the completion",
                self.gtrid
            );
            return false;
        };

        let abandoned = {
            let mut state = self.state.lock();
            state.timed_out = true;
            state.abandoned
        };
        if self.status() == Status::Active {
            tracing::warn!(
                "transaction {} timed out after {:?}, marking it as rollback only",
                self.gtrid,
                self.timeout
            );
            if let Err(e) = self.change_status(Status::MarkedRollback, &BTreeSet::new()) {
                tracing::error!("cannot mark timed out transaction {} as rollback only: {}", self.gtrid, e);
            }
        }
        abandoned
    }

    fn check_completable(&self, operation: &str) -> Result<()> {
        match self.status() {
            Status::Active | Status::MarkedRollback => Ok(()),
            status => Err(TransactionError::IllegalState(format!(
                "cannot {} transaction {} with status {}",
                operation, self.gtrid, status
            ))),
        }
    }

    /// Commit the transaction, or roll it back if it cannot commit.
    pub async fn commit(&self) -> Result<()> {
        let _completion = self.completion.lock().await;
        self.check_completable("commit")?;

        let result = self.commit_branches().await;
        self.finish().await;
        result
    }

    pub async fn rollback(&self) -> Result<()> {
        let _completion = self.completion.lock().await;
        self.check_completable("roll back")?;

        let result = self.rollback_branches().await;
        self.finish().await;
        result
    }

    async fn commit_branches(&self) -> Result<()> {
        if self.is_timed_out() {
            return self
                .abort(format!("transaction {} timed out", self.gtrid), None)
                .await;
        }
        if self.status() == Status::MarkedRollback {
            return self
                .abort(
                    format!("transaction {} was marked as rollback only", self.gtrid),
                    None,
                )
                .await;
        }

        if let Err(message) = self.fire_before_completion() {
            tracing::warn!("synchronization failed before completion of {}: {}", self.gtrid, message);
            self.set_rollback_only()?;
            return self
                .abort(
                    format!("a synchronization failed before completion of {}", self.gtrid),
                    Some(TransactionError::System(message)),
                )
                .await;
        }
        if self.status() == Status::MarkedRollback {
            return self
                .abort(
                    format!("transaction {} was marked as rollback only", self.gtrid),
                    None,
                )
                .await;
        }

        if let Err(e) = self.delist_unclosed().await {
            return self
                .abort(format!("cannot delist resources of {}", self.gtrid), Some(e))
                .await;
        }

        let executor = &self.services.executor;
        let states = self.resource_manager.lock().await.all_states();
        let interested = match Preparer::new(executor).prepare(self, states).await {
            Ok(interested) => interested,
            Err(e) => {
                return self
                    .abort(format!("transaction {} failed during prepare", self.gtrid), Some(e))
                    .await;
            }
        };

        if self.is_timed_out() {
            if self.status() == Status::Prepared && !interested.is_empty() {
                let message = format!(
                    "timed out after prepare with {} prepared resource(s), recovery will resolve them",
                    interested.len()
                );
                tracing::error!("transaction {} {}", self.gtrid, message);
                return Err(TransactionError::InDoubt {
                    gtrid: self.gtrid.to_string(),
                    message,
                });
            }
            return self
                .abort(format!("transaction {} timed out", self.gtrid), None)
                .await;
        }

        match Committer::new(executor).commit(self, interested).await {
            Ok(()) => Ok(()),
            Err(e @ (TransactionError::Heuristic { .. } | TransactionError::RolledBack { .. })) => Err(e),
            Err(e) if self.status() == Status::Committing => Err(e),
            Err(e) => {
                tracing::error!(
                    "unexpected error committing {}, attempting last chance rollback: {}",
                    self.gtrid,
                    e
                );
                let states = self.resource_manager.lock().await.all_states();
                match Rollbacker::new(executor).rollback(self, states).await {
                    Ok(()) => Err(TransactionError::rolled_back_by(
                        format!("transaction {} failed to commit", self.gtrid),
                        e,
                    )),
                    Err(rollback_error) => {
                        tracing::error!(
                            "last chance rollback of {} failed: {}",
                            self.gtrid,
                            rollback_error
                        );
                        Err(e)
                    }
                }
            }
        }
    }

    /// Roll back, then report the rollback to the committing caller.
    async fn abort(&self, message: String, cause: Option<TransactionError>) -> Result<()> {
        self.rollback_branches().await?;
        Err(TransactionError::RolledBack {
            message,
            cause: cause.map(Box::new),
        })
    }

    async fn rollback_branches(&self) -> Result<()> {
        self.delist_unclosed_quietly().await;
        let states = self.resource_manager.lock().await.all_states();
        Rollbacker::new(&self.services.executor)
            .rollback(self, states)
            .await
    }

    fn fire_before_completion(&self) -> std::result::Result<(), String> {
        let synchronizations: Vec<_> = self
            .synchronizations
            .lock()
            .natural_order_iter()
            .cloned()
            .collect();
        for synchronization in synchronizations {
            synchronization.before_completion()?;
        }
        Ok(())
    }

    fn fire_after_completion(&self, status: Status) {
        let synchronizations: Vec<_> = self
            .synchronizations
            .lock()
            .natural_order_iter()
            .cloned()
            .collect();
        for synchronization in synchronizations {
            synchronization.after_completion(status);
        }
    }

    /// End every branch still open with TMSUCCESS, stopping at the first error.
    async fn delist_unclosed(&self) -> Result<()> {
        let resource_manager = self.resource_manager.lock().await;
        for state in resource_manager.all_states() {
            if !state.is_started() || state.is_ended() {
                continue;
            }
            tracing::debug!("delisting unclosed {}", state);
            if let Err(e) = state.end(TMSUCCESS).await {
                if e.is_rollback() {
                    return Err(TransactionError::rolled_back(format!(
                        "resource {} unilaterally rolled back its branch of {}: {}",
                        state.unique_name(),
                        self.gtrid,
                        e
                    )));
                }
                return Err(TransactionError::resource(Phase::Delist, state.unique_name(), e));
            }
        }
        Ok(())
    }

    async fn delist_unclosed_quietly(&self) {
        let resource_manager = self.resource_manager.lock().await;
        for state in resource_manager.all_states() {
            if state.is_started()
                && !state.is_ended()
                && let Err(e) = state.end(TMSUCCESS).await
            {
                tracing::debug!("ignoring error delisting {} before rollback: {}", state, e);
            }
        }
    }

    /// Release everything the transaction holds, whatever its outcome.
    async fn finish(&self) {
        self.services.tasks.cancel_timeout(&self.gtrid);

        let states = self.resource_manager.lock().await.every_state();
        for state in &states {
            if let Some(holder) = state.holder() {
                holder.branch_states().remove_gtrid(&self.gtrid);
            }
        }

        let status = self.status();
        self.fire_after_completion(status);
        self.services.remove_in_flight(&self.gtrid);
        self.set_owner(None);

        if let Some(observer) = self.services.observer() {
            observer.transaction_completed(&self.info());
        }
        tracing::debug!("transaction {} completed with status {}", self.gtrid, status);
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "transaction {} [{}] with {} enlisted resource(s)",
            self.gtrid,
            state.status,
            state.enlisted.len()
        )
    }
}
