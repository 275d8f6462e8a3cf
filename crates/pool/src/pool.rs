//! Generic pool of XA-capable connections

use crate::error::{PoolError, Result};
use crate::holder::{
    ConnectionFactory, HolderState, PoolRecoveryHook, PooledConnection, StateChangeListener,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tandem_uid::Uid;
use tandem_xa::{ResourceConfig, XaResourceHolder};
use tokio::sync::Notify;
use tokio::time::Instant;

struct Slot<C> {
    id: u64,
    connection: Arc<C>,
    state: HolderState,
    last_release: Instant,
}

struct PoolInner<C> {
    slots: Vec<Slot<C>>,
    // Connections being created outside the lock
    pending: usize,
    closed: bool,
}

impl<C> PoolInner<C> {
    fn count(&self, state: HolderState) -> usize {
        self.slots.iter().filter(|slot| slot.state == state).count()
    }

    fn slot_mut(&mut self, id: u64) -> Option<&mut Slot<C>> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }
}

fn transition<C>(
    listeners: &[Arc<dyn StateChangeListener>],
    slot: &mut Slot<C>,
    to: HolderState,
) {
    let from = slot.state;
    if from == to {
        return;
    }
    for listener in listeners {
        listener.state_changing(slot.id, from, to);
    }
    slot.state = to;
    for listener in listeners {
        listener.state_changed(slot.id, from, to);
    }
    tracing::trace!("pooled connection {} changed from {} to {}", slot.id, from, to);
}

/// A connection handed out by the pool.
pub struct Lease<C: PooledConnection> {
    /// Pool slot id, used to release the connection
    pub id: u64,
    pub connection: Arc<C>,
    pub handle: C::Handle,
}

/// Point-in-time counters of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatistics {
    pub unique_name: String,
    pub in_pool: usize,
    pub accessible: usize,
    pub not_accessible: usize,
    pub total: usize,
    pub failed: bool,
}

/// Connections counted in `pending` but not created yet.
///
/// Whatever is still unsettled when this drops is given back, so an
/// acquisition cancelled while creating connections frees its capacity.
struct Reservation<'a, C> {
    inner: &'a Mutex<PoolInner<C>>,
    available: &'a Notify,
    remaining: usize,
}

impl<C> Reservation<'_, C> {
    fn settle(&mut self, inner: &mut PoolInner<C>) {
        inner.pending -= 1;
        self.remaining -= 1;
    }
}

impl<C> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.remaining > 0 {
            self.inner.lock().pending -= self.remaining;
            self.available.notify_waiters();
        }
    }
}

enum Step<C> {
    Take(u64, Arc<C>),
    Grow(usize),
    Wait,
}

/// Pool of connections created by a [`ConnectionFactory`].
///
/// All slot bookkeeping happens under one pool-wide lock. Waiters for an
/// `InPool` connection park on a [`Notify`] and also retry every
/// `acquisition_interval` until `acquisition_timeout` expires.
pub struct XaPool<F: ConnectionFactory> {
    config: Arc<ResourceConfig>,
    factory: F,
    inner: Mutex<PoolInner<F::Connection>>,
    available: Notify,
    failed: AtomicBool,
    reset_lock: tokio::sync::Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn StateChangeListener>>>,
    recovery_hook: RwLock<Option<Arc<dyn PoolRecoveryHook>>>,
    next_id: AtomicU64,
}

impl<F: ConnectionFactory> XaPool<F> {
    pub fn new(config: ResourceConfig, factory: F) -> Result<Self> {
        config.validate().map_err(PoolError::Configuration)?;
        Ok(Self {
            config: Arc::new(config),
            factory,
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                pending: 0,
                closed: false,
            }),
            available: Notify::new(),
            failed: AtomicBool::new(false),
            reset_lock: tokio::sync::Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            recovery_hook: RwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    /// Create the minimum number of connections.
    pub async fn init(&self) -> Result<()> {
        self.fill_to_min().await?;
        tracing::info!(
            "pool {} initialized with {} connection(s)",
            self.unique_name(),
            self.total_pool_size()
        );
        Ok(())
    }

    pub fn config(&self) -> &Arc<ResourceConfig> {
        &self.config
    }

    pub fn unique_name(&self) -> &str {
        &self.config.unique_name
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.write().push(listener);
    }

    pub fn set_recovery_hook(&self, hook: Arc<dyn PoolRecoveryHook>) {
        *self.recovery_hook.write() = Some(hook);
    }

    /// Mark the pool failed; the next acquisition resets it first.
    pub fn set_failed(&self, failed: bool) {
        if failed {
            tracing::warn!("pool {} marked as failed", self.unique_name());
        }
        self.failed.store(failed, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Acquire a connection.
    ///
    /// With a `gtrid`, a connection already bound to that transaction is
    /// recycled before any idle one is considered.
    pub async fn acquire(&self, gtrid: Option<&Uid>) -> Result<Lease<F::Connection>> {
        self.recover_if_failed().await?;

        let deadline = Instant::now() + self.config.acquisition_timeout;
        loop {
            let notified = self.available.notified();

            match self.next_step(gtrid)? {
                Step::Take(id, connection) => match connection.connection_handle().await {
                    Ok(handle) => {
                        tracing::debug!(
                            "acquired connection {} from pool {}",
                            id,
                            self.unique_name()
                        );
                        return Ok(Lease {
                            id,
                            connection,
                            handle,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            "evicting connection {} of pool {} after handle failure: {}",
                            id,
                            self.unique_name(),
                            e
                        );
                        self.evict(id).await;
                        if Instant::now() >= deadline {
                            return Err(PoolError::Handle {
                                name: self.unique_name().to_string(),
                                message: e.to_string(),
                            });
                        }
                    }
                },
                Step::Grow(count) => {
                    self.grow(count).await?;
                }
                Step::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.timeout_error());
                    }
                    let wait = (deadline - now).min(self.config.acquisition_interval);
                    let _ = tokio::time::timeout(wait, notified).await;
                }
            }
        }
    }

    fn next_step(&self, gtrid: Option<&Uid>) -> Result<Step<F::Connection>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(PoolError::Closed(self.unique_name().to_string()));
        }
        let listeners = self.listeners.read();

        if let Some(gtrid) = gtrid {
            let share = self.config.share_transaction_connections;
            if let Some(slot) = inner.slots.iter_mut().find(|slot| {
                (slot.state == HolderState::NotAccessible
                    || (share && slot.state == HolderState::Accessible))
                    && slot.connection.branch_states().has_state_for_gtrid(gtrid)
            }) {
                tracing::debug!(
                    "recycling connection {} of pool {} for transaction {}",
                    slot.id,
                    self.config.unique_name,
                    gtrid
                );
                transition(&listeners, slot, HolderState::Accessible);
                return Ok(Step::Take(slot.id, slot.connection.clone()));
            }
        }

        if let Some(slot) = inner
            .slots
            .iter_mut()
            .find(|slot| slot.state == HolderState::InPool)
        {
            transition(&listeners, slot, HolderState::Accessible);
            return Ok(Step::Take(slot.id, slot.connection.clone()));
        }

        let reserved = inner.slots.len() + inner.pending;
        if reserved < self.config.max_pool_size {
            let count = self
                .config
                .acquire_increment
                .min(self.config.max_pool_size - reserved);
            inner.pending += count;
            return Ok(Step::Grow(count));
        }

        Ok(Step::Wait)
    }

    /// Create `count` connections already reserved in `pending`.
    async fn grow(&self, count: usize) -> Result<usize> {
        let mut reservation = Reservation {
            inner: &self.inner,
            available: &self.available,
            remaining: count,
        };
        let mut created = 0;
        let mut last_error = None;

        for _ in 0..count {
            let result = self.factory.create_pooled_connection(&self.config).await;
            match result {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    let closed = {
                        let mut inner = self.inner.lock();
                        reservation.settle(&mut inner);
                        if !inner.closed {
                            inner.slots.push(Slot {
                                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                                connection: connection.clone(),
                                state: HolderState::InPool,
                                last_release: Instant::now(),
                            });
                        }
                        inner.closed
                    };
                    if closed {
                        let _ = connection.close().await;
                    } else {
                        created += 1;
                        self.available.notify_waiters();
                    }
                }
                Err(e) => {
                    reservation.settle(&mut self.inner.lock());
                    tracing::warn!(
                        "failed to create a connection for pool {}: {}",
                        self.unique_name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if created == 0 => Err(e),
            _ => {
                tracing::debug!(
                    "pool {} grew by {} connection(s)",
                    self.unique_name(),
                    created
                );
                Ok(created)
            }
        }
    }

    async fn fill_to_min(&self) -> Result<()> {
        let missing = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            let reserved = inner.slots.len() + inner.pending;
            let missing = self.config.min_pool_size.saturating_sub(reserved);
            inner.pending += missing;
            missing
        };
        if missing > 0 {
            self.grow(missing).await?;
        }
        Ok(())
    }

    fn timeout_error(&self) -> PoolError {
        let inner = self.inner.lock();
        PoolError::Timeout {
            name: self.unique_name().to_string(),
            timeout: self.config.acquisition_timeout,
            in_pool: inner.count(HolderState::InPool),
            total: inner.slots.len(),
        }
    }

    /// Return a connection to the pool.
    pub fn release(&self, id: u64) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let listeners = self.listeners.read();
            let slot = inner.slot_mut(id).ok_or(PoolError::UnknownConnection(id))?;
            transition(&listeners, slot, HolderState::InPool);
            slot.last_release = Instant::now();
        }
        tracing::debug!("released connection {} to pool {}", id, self.unique_name());
        self.available.notify_waiters();
        Ok(())
    }

    /// Keep a connection out of the pool while its transaction is running.
    pub fn mark_not_accessible(&self, id: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let listeners = self.listeners.read();
        let slot = inner.slot_mut(id).ok_or(PoolError::UnknownConnection(id))?;
        transition(&listeners, slot, HolderState::NotAccessible);
        Ok(())
    }

    pub fn state_of(&self, id: u64) -> Option<HolderState> {
        self.inner
            .lock()
            .slots
            .iter()
            .find(|slot| slot.id == id)
            .map(|slot| slot.state)
    }

    /// Close a connection and free its slot.
    pub async fn evict(&self, id: u64) {
        let connection = {
            let mut inner = self.inner.lock();
            let listeners = self.listeners.read();
            let Some(index) = inner.slots.iter().position(|slot| slot.id == id) else {
                return;
            };
            let mut slot = inner.slots.remove(index);
            transition(&listeners, &mut slot, HolderState::Closed);
            slot.connection
        };
        self.available.notify_waiters();

        if let Err(e) = connection.close().await {
            tracing::warn!(
                "error closing evicted connection {} of pool {}: {}",
                id,
                self.unique_name(),
                e
            );
        }
    }

    /// Close idle connections beyond the minimum whose idle time exceeds
    /// `max_idle_time`, then create connections up to the minimum.
    pub async fn shrink(&self) -> Result<usize> {
        let now = Instant::now();
        let victims: Vec<Arc<F::Connection>> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(0);
            }
            let listeners = self.listeners.read();
            let mut removable = inner.slots.len().saturating_sub(self.config.min_pool_size);
            let mut victims = Vec::new();
            inner.slots.retain_mut(|slot| {
                let idle = now.saturating_duration_since(slot.last_release);
                if removable > 0
                    && slot.state == HolderState::InPool
                    && idle >= self.config.max_idle_time
                {
                    transition(&listeners, slot, HolderState::Closed);
                    victims.push(slot.connection.clone());
                    removable -= 1;
                    false
                } else {
                    true
                }
            });
            victims
        };

        let closed = victims.len();
        for connection in victims {
            if let Err(e) = connection.close().await {
                tracing::warn!(
                    "error closing idle connection of pool {}: {}",
                    self.unique_name(),
                    e
                );
            }
        }
        if closed > 0 {
            tracing::debug!("pool {} shrunk by {} connection(s)", self.unique_name(), closed);
        }

        self.fill_to_min().await?;
        Ok(closed)
    }

    /// Close every idle connection and refill to the minimum.
    pub async fn reset(&self) -> Result<()> {
        let victims: Vec<Arc<F::Connection>> = {
            let mut inner = self.inner.lock();
            let listeners = self.listeners.read();
            let mut victims = Vec::new();
            inner.slots.retain_mut(|slot| {
                if slot.state == HolderState::InPool {
                    transition(&listeners, slot, HolderState::Closed);
                    victims.push(slot.connection.clone());
                    false
                } else {
                    true
                }
            });
            victims
        };

        for connection in victims {
            let _ = connection.close().await;
        }
        self.fill_to_min().await?;
        tracing::info!("pool {} reset", self.unique_name());
        Ok(())
    }

    async fn recover_if_failed(&self) -> Result<()> {
        if !self.is_failed() {
            return Ok(());
        }
        let _guard = self.reset_lock.lock().await;
        if !self.is_failed() {
            return Ok(());
        }

        tracing::info!("resetting failed pool {}", self.unique_name());
        self.reset().await?;

        let hook = self.recovery_hook.read().clone();
        if let Some(hook) = hook {
            hook.recover_pool(self.unique_name())
                .await
                .map_err(|message| PoolError::Recovery {
                    name: self.unique_name().to_string(),
                    message,
                })?;
        }
        self.failed.store(false, Ordering::Release);
        Ok(())
    }

    /// Create a connection outside of the pool, e.g. for a recovery scan.
    pub async fn create_standalone(&self) -> Result<F::Connection> {
        self.factory.create_pooled_connection(&self.config).await
    }

    pub fn in_pool_size(&self) -> usize {
        self.inner.lock().count(HolderState::InPool)
    }

    pub fn total_pool_size(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn stats(&self) -> PoolStatistics {
        let inner = self.inner.lock();
        PoolStatistics {
            unique_name: self.unique_name().to_string(),
            in_pool: inner.count(HolderState::InPool),
            accessible: inner.count(HolderState::Accessible),
            not_accessible: inner.count(HolderState::NotAccessible),
            total: inner.slots.len(),
            failed: self.is_failed(),
        }
    }

    /// Close every connection. Pending and future acquisitions fail.
    pub async fn close(&self) {
        let connections: Vec<Arc<F::Connection>> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let listeners = self.listeners.read();
            for slot in inner.slots.iter_mut() {
                transition(&listeners, slot, HolderState::Closed);
            }
            inner.slots.drain(..).map(|slot| slot.connection).collect()
        };
        self.available.notify_waiters();

        for connection in connections {
            if let Err(e) = connection.close().await {
                tracing::warn!(
                    "error closing connection of pool {}: {}",
                    self.unique_name(),
                    e
                );
            }
        }
        tracing::info!("pool {} closed", self.unique_name());
    }
}
