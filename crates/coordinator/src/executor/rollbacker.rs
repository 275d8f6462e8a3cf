use super::{PhaseExecutor, forget_branch, group_by_position, join_names, unique_names};
use crate::error::{HeuristicOutcome, Result, TransactionError};
use crate::transaction::Transaction;
use futures::FutureExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use tandem_scheduler::Order;
use tandem_xa::{BranchState, HeuristicKind, Status, XaError};

async fn rollback_branch(state: Arc<BranchState>) -> std::result::Result<Option<HeuristicKind>, XaError> {
    let error = match state.rollback().await {
        Ok(()) => return Ok(None),
        Err(e) => e,
    };

    if error.is_rollback() || error.is_not_a() {
        tracing::debug!("{} was already rolled back: {}", state, error);
        return Ok(None);
    }
    match error.heuristic() {
        Some(HeuristicKind::Rollback) => {
            forget_branch(&state).await;
            Ok(None)
        }
        Some(kind) => {
            tracing::error!("heuristic {:?} reported by {} during rollback: {}", kind, state, error);
            forget_branch(&state).await;
            Ok(Some(kind))
        }
        None => {
            tracing::warn!("error rolling back {}: {}", state, error);
            Err(error)
        }
    }
}

/// Abort path of two-phase commit.
///
/// Branches are rolled back in reverse position order. Failed branches get a
/// second, last chance attempt before the rollback is reported as failed.
pub struct Rollbacker<'a> {
    executor: &'a PhaseExecutor,
}

impl<'a> Rollbacker<'a> {
    pub fn new(executor: &'a PhaseExecutor) -> Self {
        Self { executor }
    }

    pub async fn rollback(&self, tx: &Transaction, states: Vec<Arc<BranchState>>) -> Result<()> {
        let names = unique_names(&states);
        if tx.status() != Status::RollingBack {
            tx.change_status(Status::RollingBack, &names)?;
        }

        let mut heuristics: Vec<(String, HeuristicKind)> = Vec::new();
        let mut pending = states;
        let mut failed: Vec<(Arc<BranchState>, XaError)> = Vec::new();

        for attempt in 0..2 {
            failed.clear();
            for group in group_by_position(&pending, Order::Reverse) {
                let jobs = group
                    .iter()
                    .map(|state| rollback_branch(state.clone()).boxed())
                    .collect();
                let results = self.executor.run(jobs).await;
                for (state, result) in group.into_iter().zip(results) {
                    match result {
                        Ok(None) => {}
                        Ok(Some(kind)) => heuristics.push((state.unique_name().to_string(), kind)),
                        Err(e) => failed.push((state, e)),
                    }
                }
            }

            if failed.is_empty() {
                break;
            }
            if attempt == 0 {
                tracing::warn!(
                    "retrying rollback of {} resource(s) in {}",
                    failed.len(),
                    tx.gtrid()
                );
                pending = failed.iter().map(|(state, _)| state.clone()).collect();
            }
        }

        if heuristics.is_empty() && failed.is_empty() {
            tx.change_status(Status::RolledBack, &names)?;
            tracing::debug!("transaction {} rolled back", tx.gtrid());
            return Ok(());
        }

        let unresolved: BTreeSet<&str> = failed.iter().map(|(state, _)| state.unique_name()).collect();
        let resolved: BTreeSet<String> = names
            .iter()
            .filter(|name| !unresolved.contains(name.as_str()))
            .cloned()
            .collect();
        tx.change_status(Status::Unknown, &resolved)?;

        let failures = failed
            .iter()
            .map(|(state, e)| format!("{} failed: {}", state.unique_name(), e))
            .collect::<Vec<_>>();

        if heuristics.is_empty() {
            let message = format!(
                "transaction {} failed to roll back: {}",
                tx.gtrid(),
                failures.join(", ")
            );
            tracing::error!("{}", message);
            return Err(TransactionError::System(message));
        }

        let outcome = if heuristics.iter().any(|(_, kind)| *kind == HeuristicKind::Hazard)
            || !failed.is_empty()
        {
            HeuristicOutcome::Hazard
        } else if heuristics.len() == names.len()
            && heuristics.iter().all(|(_, kind)| *kind == HeuristicKind::Commit)
        {
            HeuristicOutcome::Commit
        } else {
            HeuristicOutcome::Mixed
        };
        let mut message = format!(
            "transaction {} did not fully roll back, heuristic outcome on [{}]",
            tx.gtrid(),
            join_names(heuristics.iter().map(|(name, _)| name.as_str()))
        );
        if !failures.is_empty() {
            message.push_str(&format!(", {}", failures.join(", ")));
        }
        tracing::error!("{}", message);
        Err(TransactionError::Heuristic { outcome, message })
    }
}
