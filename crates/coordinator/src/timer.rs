//! Background tasks: transaction timeouts and periodic maintenance

use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tandem_uid::Uid;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Owns every background task so they can be cancelled on shutdown.
#[derive(Default)]
pub struct TaskScheduler {
    timeouts: Mutex<HashMap<Uid, JoinHandle<()>>>,
    periodic: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the transaction's timeout handler at its deadline.
    ///
    /// The task only holds a weak reference, a completed transaction is never
    /// kept alive by its timer.
    pub fn schedule_timeout(&self, tx: &Arc<Transaction>) {
        let weak = Arc::downgrade(tx);
        let deadline = tx.deadline();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(tx) = weak.upgrade()
                && tx.timeout_expired()
            {
                // finishing cancels this task, so the rollback runs on its own
                tokio::spawn(async move { tx.rollback_abandoned().await });
            }
        });

        if let Some(previous) = self.timeouts.lock().insert(tx.gtrid().clone(), handle) {
            previous.abort();
        }
    }

    pub fn cancel_timeout(&self, gtrid: &Uid) {
        if let Some(handle) = self.timeouts.lock().remove(gtrid) {
            handle.abort();
        }
    }

    /// Run `task` every `interval`, the first run one interval from now.
    pub fn schedule_periodic<F, Fut>(&self, name: &'static str, interval: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tracing::trace!("running periodic task {}", name);
                task().await;
            }
        });
        tracing::debug!("scheduled {} every {:?}", name, interval);
        self.periodic.lock().push((name, handle));
    }

    pub fn periodic_tasks(&self) -> Vec<&'static str> {
        self.periodic.lock().iter().map(|(name, _)| *name).collect()
    }

    /// Abort every scheduled task.
    pub fn shutdown(&self) {
        for (_, handle) in self.timeouts.lock().drain() {
            handle.abort();
        }
        for (name, handle) in self.periodic.lock().drain(..) {
            tracing::debug!("cancelling periodic task {}", name);
            handle.abort();
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
