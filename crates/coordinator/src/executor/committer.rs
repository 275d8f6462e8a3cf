use super::{PhaseExecutor, forget_branch, group_by_position, join_names, unique_names};
use crate::error::{HeuristicOutcome, Result, TransactionError};
use crate::transaction::Transaction;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tandem_scheduler::Order;
use tandem_xa::{BranchState, HeuristicKind, Status, XaError};

/// What happened to one branch during the commit phase.
enum BranchOutcome {
    Committed,
    /// Unilateral rollback reported by a one-phase commit
    RolledBack,
    /// Heuristic completion, already forgotten
    Heuristic(HeuristicKind),
}

#[derive(Default)]
struct Tally {
    committed: Vec<String>,
    rolled_back: Vec<String>,
    heuristic_rollback: Vec<String>,
    heuristic_mixed: Vec<String>,
    heuristic_hazard: Vec<String>,
    failed: Vec<(String, XaError)>,
}

impl Tally {
    fn record(&mut self, name: &str, result: std::result::Result<BranchOutcome, XaError>) {
        let name = name.to_string();
        match result {
            Ok(BranchOutcome::Committed) | Ok(BranchOutcome::Heuristic(HeuristicKind::Commit)) => {
                self.committed.push(name)
            }
            Ok(BranchOutcome::RolledBack) => self.rolled_back.push(name),
            Ok(BranchOutcome::Heuristic(HeuristicKind::Rollback)) => {
                self.heuristic_rollback.push(name)
            }
            Ok(BranchOutcome::Heuristic(HeuristicKind::Mixed)) => self.heuristic_mixed.push(name),
            Ok(BranchOutcome::Heuristic(HeuristicKind::Hazard)) => {
                self.heuristic_hazard.push(name)
            }
            Err(e) => self.failed.push((name, e)),
        }
    }

    fn is_clean(&self) -> bool {
        self.heuristic_rollback.is_empty()
            && self.heuristic_mixed.is_empty()
            && self.heuristic_hazard.is_empty()
            && self.failed.is_empty()
    }

    /// Names whose branch reached a final state.
    fn resolved(&self) -> BTreeSet<String> {
        self.committed
            .iter()
            .chain(&self.heuristic_rollback)
            .chain(&self.heuristic_mixed)
            .chain(&self.heuristic_hazard)
            .cloned()
            .collect()
    }

    fn outcome(&self) -> HeuristicOutcome {
        if !self.heuristic_mixed.is_empty()
            || (!self.committed.is_empty() && !self.heuristic_rollback.is_empty())
        {
            HeuristicOutcome::Mixed
        } else if !self.heuristic_rollback.is_empty()
            && self.heuristic_hazard.is_empty()
            && self.failed.is_empty()
        {
            HeuristicOutcome::Rollback
        } else {
            HeuristicOutcome::Hazard
        }
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        let mut add = |label: &str, names: &[String]| {
            if !names.is_empty() {
                parts.push(format!(
                    "{}: [{}]",
                    label,
                    join_names(names.iter().map(String::as_str))
                ));
            }
        };
        add("committed", &self.committed);
        add("heuristically rolled back", &self.heuristic_rollback);
        add("heuristic mixed", &self.heuristic_mixed);
        add("heuristic hazard", &self.heuristic_hazard);
        for (name, e) in &self.failed {
            parts.push(format!("{} failed: {}", name, e));
        }
        parts.join(", ")
    }
}

async fn commit_branch(
    state: Arc<BranchState>,
    one_phase: bool,
) -> std::result::Result<BranchOutcome, XaError> {
    let error = match state.commit(one_phase).await {
        Ok(()) => return Ok(BranchOutcome::Committed),
        Err(e) => e,
    };

    if one_phase && error.is_rollback() {
        tracing::warn!("{} rolled back during one-phase commit: {}", state, error);
        return Ok(BranchOutcome::RolledBack);
    }
    if let Some(kind) = error.heuristic() {
        tracing::error!("heuristic {:?} reported by {}: {}", kind, state, error);
        forget_branch(&state).await;
        return Ok(BranchOutcome::Heuristic(kind));
    }
    if !one_phase && error.is_not_a() {
        tracing::warn!(
            "{} does not know the branch anymore, assuming it committed: {}",
            state,
            error
        );
        return Ok(BranchOutcome::Committed);
    }

    tracing::error!("error committing {}: {}", state, error);
    Err(error)
}

/// Second phase of two-phase commit, or the only phase of one-phase commit.
pub struct Committer<'a> {
    executor: &'a PhaseExecutor,
}

impl<'a> Committer<'a> {
    pub fn new(executor: &'a PhaseExecutor) -> Self {
        Self { executor }
    }

    /// Commit the interested branches.
    ///
    /// One-phase commit is used when the transaction skipped the prepare
    /// phase. Branch failures are collected, then classified into a single
    /// heuristic outcome.
    pub async fn commit(&self, tx: &Transaction, interested: Vec<Arc<BranchState>>) -> Result<()> {
        let one_phase = tx.status() == Status::Active;
        let names = unique_names(&interested);
        tx.change_status(Status::Committing, &names)?;

        let mut tally = Tally::default();
        for group in group_by_position(&interested, Order::Natural) {
            let jobs = group
                .iter()
                .map(|state| commit_branch(state.clone(), one_phase).boxed())
                .collect();
            let results = self.executor.run(jobs).await;
            for (state, result) in group.iter().zip(results) {
                tally.record(state.unique_name(), result);
            }
        }

        if one_phase && !tally.rolled_back.is_empty() {
            tx.change_status(Status::RollingBack, &names)?;
            tx.change_status(Status::RolledBack, &names)?;
            return Err(TransactionError::rolled_back(format!(
                "resource {} unilaterally rolled back during one-phase commit of {}",
                join_names(tally.rolled_back.iter().map(String::as_str)),
                tx.gtrid()
            )));
        }

        if tally.is_clean() {
            tx.change_status(Status::Committed, &names)?;
            tracing::debug!("transaction {} committed on {} resource(s)", tx.gtrid(), names.len());
            return Ok(());
        }

        // Failed branches stay dangling in the journal for recovery
        tx.change_status(Status::Unknown, &tally.resolved())?;
        let outcome = tally.outcome();
        let message = format!("transaction {} partially failed to commit: {}", tx.gtrid(), tally.describe());
        tracing::error!("{}", message);
        Err(TransactionError::Heuristic { outcome, message })
    }
}
