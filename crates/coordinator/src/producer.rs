//! Resource producer backed by an [`XaPool`]
//!
//! [`TransactionalConnection`] wraps a pooled handle and enlists its resource
//! in the caller's transaction before every use.

use crate::error::{Result, TransactionError};
use crate::registrar::XaResourceProducer;
use crate::resource_manager::Enlistment;
use crate::synchronization::Synchronization;
use crate::transaction::Transaction;
use async_trait::async_trait;
use std::sync::Arc;
use tandem_pool::{
    ConnectionFactory, HolderState, PoolRecoveryHook, PoolStatistics, PooledConnection, XaPool,
};
use tandem_scheduler::ALWAYS_LAST_POSITION;
use tandem_xa::flags::TMSUCCESS;
use tandem_xa::{ResourceConfig, Status, XaError, XaResource, XaResourceHolder};
use tokio::sync::Mutex as AsyncMutex;

type Handle<F> = <<F as ConnectionFactory>::Connection as PooledConnection>::Handle;

/// Pool-backed producer of transactional connections.
pub struct PoolingProducer<F: ConnectionFactory> {
    pool: Arc<XaPool<F>>,
    /// Connection opened for a recovery scan
    recovery: AsyncMutex<Option<F::Connection>>,
}

impl<F: ConnectionFactory> PoolingProducer<F> {
    /// Create the pool and fill it to its minimum size.
    pub async fn new(config: ResourceConfig, factory: F) -> Result<Arc<Self>> {
        let pool = Arc::new(XaPool::new(config, factory)?);
        pool.init().await?;
        Ok(Arc::new(Self {
            pool,
            recovery: AsyncMutex::new(None),
        }))
    }

    pub fn pool(&self) -> &Arc<XaPool<F>> {
        &self.pool
    }

    /// Acquire a connection, enlisting it in `tx` when automatic enlisting is on.
    ///
    /// A connection this transaction already closed is recycled first.
    pub async fn get_connection(&self, tx: Option<&Transaction>) -> Result<TransactionalConnection<F>> {
        let lease = self.pool.acquire(tx.map(Transaction::gtrid)).await?;
        let connection = TransactionalConnection {
            pool: self.pool.clone(),
            id: lease.id,
            connection: lease.connection,
            handle: lease.handle,
            closed: false,
        };

        if let Some(tx) = tx
            && self.pool.config().automatic_enlisting_enabled
            && let Err(e) = connection.enlist(tx).await
        {
            connection.discard();
            return Err(e);
        }
        Ok(connection)
    }
}

#[async_trait]
impl<F: ConnectionFactory> XaResourceProducer for PoolingProducer<F> {
    fn unique_name(&self) -> &str {
        self.pool.unique_name()
    }

    fn config(&self) -> Arc<ResourceConfig> {
        self.pool.config().clone()
    }

    async fn start_recovery(&self) -> std::result::Result<Arc<dyn XaResource>, XaError> {
        let mut recovery = self.recovery.lock().await;
        if recovery.is_some() {
            return Err(XaError::protocol(format!(
                "recovery of {} is already started",
                self.unique_name()
            )));
        }
        let connection = self
            .pool
            .create_standalone()
            .await
            .map_err(|e| XaError::rm_fail(e.to_string()))?;
        let xa_resource = connection.xa_resource();
        *recovery = Some(connection);
        Ok(xa_resource)
    }

    async fn end_recovery(&self) -> std::result::Result<(), XaError> {
        let connection = self.recovery.lock().await.take();
        match connection {
            Some(connection) => connection
                .close()
                .await
                .map_err(|e| XaError::rm_err(e.to_string())),
            None => Ok(()),
        }
    }

    fn set_failed(&self, failed: bool) {
        self.pool.set_failed(failed);
    }

    fn set_recovery_hook(&self, hook: Arc<dyn PoolRecoveryHook>) {
        self.pool.set_recovery_hook(hook);
    }

    async fn shrink(&self) -> usize {
        match self.pool.shrink().await {
            Ok(closed) => closed,
            Err(e) => {
                tracing::warn!("error shrinking pool {}: {}", self.unique_name(), e);
                0
            }
        }
    }

    fn statistics(&self) -> Option<PoolStatistics> {
        Some(self.pool.stats())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// A pooled connection handed out to client code.
pub struct TransactionalConnection<F: ConnectionFactory> {
    pool: Arc<XaPool<F>>,
    id: u64,
    connection: Arc<F::Connection>,
    handle: Handle<F>,
    closed: bool,
}

impl<F: ConnectionFactory> TransactionalConnection<F> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unique_name(&self) -> &str {
        self.pool.unique_name()
    }

    fn holder(&self) -> Arc<dyn XaResourceHolder> {
        self.connection.clone()
    }

    /// Enlist the connection's resource in `tx`. Re-enlisting is a no-op.
    ///
    /// Each new branch registers a release of this connection after `tx`
    /// completes, which takes effect once the connection is no longer
    /// accessible.
    pub async fn enlist(&self, tx: &Transaction) -> Result<Enlistment> {
        let enlistment = tx.enlist_resource(&self.holder()).await?;
        if let Enlistment::Started(_) | Enlistment::Joined(_) = enlistment {
            let release = Arc::new(DeferredRelease {
                pool: self.pool.clone(),
                id: self.id,
                connection: self.connection.clone(),
            });
            if let Err(e) = tx.register_synchronization(release, ALWAYS_LAST_POSITION) {
                tracing::warn!(
                    "connection {} of {} is not released when {} completes: {}",
                    self.id,
                    self.unique_name(),
                    tx.gtrid(),
                    e
                );
            }
        }
        Ok(enlistment)
    }

    /// Run `f` on the handle, enlisting in `tx` first.
    ///
    /// Without a transaction the handle is only usable when the resource
    /// allows local transactions.
    pub async fn with_handle<R>(
        &mut self,
        tx: Option<&Transaction>,
        f: impl FnOnce(&mut Handle<F>) -> R,
    ) -> Result<R> {
        if self.closed {
            return Err(TransactionError::IllegalState(format!(
                "connection {} of {} is closed",
                self.id,
                self.unique_name()
            )));
        }

        match tx {
            Some(tx) => {
                self.enlist(tx).await?;
            }
            None if !self.pool.config().allow_local_transactions => {
                return Err(TransactionError::IllegalState(format!(
                    "resource {} does not allow use outside a global transaction",
                    self.unique_name()
                )));
            }
            None => {}
        }
        Ok(f(&mut self.handle))
    }

    /// Hand the handle back.
    ///
    /// An open branch is ended with TMSUCCESS. With deferred release the
    /// connection stays reserved for `tx` until it completes.
    pub async fn close(mut self, tx: Option<&Transaction>) -> Result<()> {
        self.closed = true;
        let holder = self.holder();
        let branch_states = self.connection.branch_states();

        let Some(tx) = tx.filter(|tx| branch_states.has_state_for_gtrid(tx.gtrid())) else {
            self.pool.release(self.id)?;
            return Ok(());
        };

        let delisted = if branch_states.is_participating_in_active_global_transaction() {
            tx.delist_resource(&holder, TMSUCCESS).await
        } else {
            Ok(())
        };

        if self.pool.config().defer_connection_release {
            self.pool.mark_not_accessible(self.id)?;
            // completed while closing, the release already ran
            if branch_states.is_empty() {
                self.pool.release(self.id)?;
            }
        } else {
            self.pool.release(self.id)?;
        }
        delisted
    }

    fn discard(mut self) {
        self.closed = true;
        if let Err(e) = self.pool.release(self.id) {
            tracing::warn!("cannot release connection {}: {}", self.id, e);
        }
    }
}

impl<F: ConnectionFactory> Drop for TransactionalConnection<F> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let branch_states = self.connection.branch_states();
        if branch_states.is_empty() {
            tracing::warn!(
                "connection {} of {} dropped without being closed, releasing it",
                self.id,
                self.unique_name()
            );
            if let Err(e) = self.pool.release(self.id) {
                tracing::warn!("cannot release connection {}: {}", self.id, e);
            }
            return;
        }

        tracing::warn!(
            "connection {} of {} dropped without being closed while enlisted, \
             releasing it when its transaction completes",
            self.id,
            self.unique_name()
        );
        let reserved = self
            .pool
            .mark_not_accessible(self.id)
            .and_then(|_| {
                if branch_states.is_empty() {
                    self.pool.release(self.id)
                } else {
                    Ok(())
                }
            });
        if let Err(e) = reserved {
            tracing::warn!("cannot reserve connection {}: {}", self.id, e);
        }
    }
}

/// Returns a connection to its pool once the transaction it served completed.
struct DeferredRelease<F: ConnectionFactory> {
    pool: Arc<XaPool<F>>,
    id: u64,
    connection: Arc<F::Connection>,
}

impl<F: ConnectionFactory> Synchronization for DeferredRelease<F> {
    fn after_completion(&self, status: Status) {
        // still in use by client code, or reserved again by another transaction
        if self.pool.state_of(self.id) != Some(HolderState::NotAccessible)
            || !self.connection.branch_states().is_empty()
        {
            return;
        }
        tracing::debug!(
            "releasing connection {} of {} after completion with status {}",
            self.id,
            self.pool.unique_name(),
            status
        );
        if let Err(e) = self.pool.release(self.id) {
            tracing::warn!("cannot release connection {}: {}", self.id, e);
        }
    }
}
