use super::{PhaseExecutor, group_by_position, join_names, unique_names};
use crate::error::{Phase, Result, TransactionError};
use crate::transaction::Transaction;
use futures::FutureExt;
use std::sync::Arc;
use tandem_scheduler::Order;
use tandem_xa::{BranchState, Status, Vote};

/// First phase of two-phase commit.
pub struct Preparer<'a> {
    executor: &'a PhaseExecutor,
}

impl<'a> Preparer<'a> {
    pub fn new(executor: &'a PhaseExecutor) -> Self {
        Self { executor }
    }

    /// Ask every branch to vote and return the ones with work to commit.
    ///
    /// A transaction with a single branch is not prepared at all and that
    /// branch is returned as is, so the committer can use one-phase commit.
    pub async fn prepare(
        &self,
        tx: &Transaction,
        states: Vec<Arc<BranchState>>,
    ) -> Result<Vec<Arc<BranchState>>> {
        if states.is_empty() {
            if tx.services().config.warn_about_zero_resource_transaction {
                tracing::warn!(
                    "executing transaction {} with 0 enlisted resource",
                    tx.gtrid()
                );
            } else {
                tracing::debug!("0 resource enlisted in {}, no prepare needed", tx.gtrid());
            }
            return Ok(states);
        }

        if states.len() == 1 {
            tracing::debug!(
                "one resource enlisted in {}, skipping prepare of {}",
                tx.gtrid(),
                states[0].unique_name()
            );
            return Ok(states);
        }

        tx.change_status(Status::Preparing, &unique_names(&states))?;

        let mut interested = Vec::with_capacity(states.len());
        for group in group_by_position(&states, Order::Natural) {
            if tx.is_timed_out() {
                return Err(TransactionError::TimedOut(format!(
                    "transaction {} timed out during prepare",
                    tx.gtrid()
                )));
            }

            let jobs = group
                .iter()
                .map(|state| {
                    let state = state.clone();
                    async move { state.prepare().await }.boxed()
                })
                .collect();
            let results = self.executor.run(jobs).await;

            let mut failure = None;
            for (state, result) in group.into_iter().zip(results) {
                match result {
                    Ok(Vote::Ok) => interested.push(state),
                    Ok(Vote::ReadOnly) => {
                        tracing::debug!("{} voted read-only, it will not be committed", state);
                    }
                    Err(e) => {
                        tracing::warn!("error preparing {}: {}", state, e);
                        if failure.is_none() {
                            failure = Some(TransactionError::resource(
                                Phase::Prepare,
                                state.unique_name(),
                                e,
                            ));
                        }
                    }
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
        }

        let names = unique_names(&interested);
        tracing::debug!(
            "{} interested resource(s) in {}: {}",
            interested.len(),
            tx.gtrid(),
            join_names(names.iter().map(String::as_str))
        );
        tx.change_status(Status::Prepared, &names)?;
        Ok(interested)
    }
}
