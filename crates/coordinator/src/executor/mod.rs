//! Two-phase commit executors
//!
//! - Preparer: first phase vote across enlisted branches
//! - Committer: second phase commit, one-phase for a single branch
//! - Rollbacker: abort path, tolerant of branches that already rolled back
//!
//! Branches are processed position by position. Within a position they run
//! one after the other or concurrently, depending on the [`PhaseExecutor`].

mod committer;
mod preparer;
mod rollbacker;

pub use committer::Committer;
pub use preparer::Preparer;
pub use rollbacker::Rollbacker;

use futures::future::{BoxFuture, join_all};
use std::collections::BTreeSet;
use std::sync::Arc;
use tandem_scheduler::{Order, Scheduler};
use tandem_xa::{BranchState, XaError};
use tokio::sync::Semaphore;

/// Runs the branch operations of one phase position.
pub enum PhaseExecutor {
    /// One branch at a time
    Sequential,
    /// Concurrent tasks, bounded by a semaphore
    Parallel { permits: Arc<Semaphore> },
}

impl PhaseExecutor {
    pub fn sequential() -> Self {
        PhaseExecutor::Sequential
    }

    pub fn parallel(max_workers: usize) -> Self {
        PhaseExecutor::Parallel {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Run every job to completion and return results in job order.
    pub async fn run<R: Send + 'static>(
        &self,
        jobs: Vec<BoxFuture<'static, Result<R, XaError>>>,
    ) -> Vec<Result<R, XaError>> {
        match self {
            PhaseExecutor::Sequential => {
                let mut results = Vec::with_capacity(jobs.len());
                for job in jobs {
                    results.push(job.await);
                }
                results
            }
            PhaseExecutor::Parallel { permits } => {
                let handles: Vec<_> = jobs
                    .into_iter()
                    .map(|job| {
                        let permits = permits.clone();
                        tokio::spawn(async move {
                            let _permit = permits.acquire_owned().await.ok();
                            job.await
                        })
                    })
                    .collect();

                join_all(handles)
                    .await
                    .into_iter()
                    .map(|joined| {
                        joined.unwrap_or_else(|e| {
                            Err(XaError::rm_err(format!("branch task failed: {}", e)))
                        })
                    })
                    .collect()
            }
        }
    }
}

/// Group branches by two-phase commit position in the given order.
pub(crate) fn group_by_position(
    states: &[Arc<BranchState>],
    order: Order,
) -> Vec<Vec<Arc<BranchState>>> {
    let mut scheduler = Scheduler::new();
    for state in states {
        scheduler.add(state.clone(), state.two_pc_ordering_position());
    }

    match order {
        Order::Natural => scheduler
            .natural_order_positions()
            .into_iter()
            .map(|position| {
                scheduler
                    .by_natural_order_for_position(position)
                    .cloned()
                    .collect()
            })
            .collect(),
        Order::Reverse => scheduler
            .reverse_order_positions()
            .into_iter()
            .map(|position| {
                scheduler
                    .by_reverse_order_for_position(position)
                    .cloned()
                    .collect()
            })
            .collect(),
    }
}

pub(crate) fn unique_names(states: &[Arc<BranchState>]) -> BTreeSet<String> {
    states
        .iter()
        .map(|state| state.unique_name().to_string())
        .collect()
}

/// Forget a heuristically completed branch, logging failures.
pub(crate) async fn forget_branch(state: &BranchState) {
    if let Err(e) = state.forget().await {
        tracing::error!("cannot forget {} after heuristic completion: {}", state, e);
    }
}

pub(crate) fn join_names<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names.into_iter().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn jobs(
        running: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
    ) -> Vec<BoxFuture<'static, Result<usize, XaError>>> {
        (0..6)
            .map(|i| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    if i == 3 {
                        Err(XaError::rm_fail("branch 3 unreachable"))
                    } else {
                        Ok(i)
                    }
                }
                .boxed()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sequential_runs_one_at_a_time() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = PhaseExecutor::sequential()
            .run(jobs(&running, &peak))
            .await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(results.len(), 6);
        assert!(results[3].is_err());
        assert_eq!(*results[5].as_ref().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_parallel_is_bounded_and_ordered() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = PhaseExecutor::parallel(2)
            .run(jobs(&running, &peak))
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        let values: Vec<Option<usize>> = results.into_iter().map(Result::ok).collect();
        assert_eq!(
            values,
            vec![Some(0), Some(1), Some(2), None, Some(4), Some(5)]
        );
    }
}
