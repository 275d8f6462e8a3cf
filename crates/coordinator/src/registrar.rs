//! Registry of resource producers known to the transaction manager

use crate::error::{Result, TransactionError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tandem_pool::{PoolRecoveryHook, PoolStatistics};
use tandem_xa::{ResourceConfig, XaError, XaResource};

/// A source of transactional resources, usually backed by a pool.
#[async_trait]
pub trait XaResourceProducer: Send + Sync + 'static {
    fn unique_name(&self) -> &str;

    fn config(&self) -> Arc<ResourceConfig>;

    /// Open a resource to scan for in-doubt branches.
    async fn start_recovery(&self) -> std::result::Result<Arc<dyn XaResource>, XaError>;

    /// Release whatever `start_recovery` opened.
    async fn end_recovery(&self) -> std::result::Result<(), XaError>;

    /// Mark the producer failed after a recovery error.
    fn set_failed(&self, failed: bool);

    /// Called on registration so a failed pool can trigger incremental recovery.
    fn set_recovery_hook(&self, _hook: Arc<dyn PoolRecoveryHook>) {}

    /// Close idle pooled objects above the minimum size.
    async fn shrink(&self) -> usize {
        0
    }

    fn statistics(&self) -> Option<PoolStatistics> {
        None
    }

    async fn close(&self);
}

/// Producers by unique name.
#[derive(Default)]
pub struct Registrar {
    producers: RwLock<BTreeMap<String, Arc<dyn XaResourceProducer>>>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, producer: Arc<dyn XaResourceProducer>) -> Result<()> {
        let name = producer.unique_name().to_string();
        let mut producers = self.producers.write();
        if producers.contains_key(&name) {
            return Err(TransactionError::IllegalState(format!(
                "a resource with unique name '{}' is already registered",
                name
            )));
        }
        tracing::debug!("registering resource {}", name);
        producers.insert(name, producer);
        Ok(())
    }

    pub fn unregister(&self, unique_name: &str) -> Option<Arc<dyn XaResourceProducer>> {
        let removed = self.producers.write().remove(unique_name);
        if removed.is_some() {
            tracing::debug!("unregistered resource {}", unique_name);
        }
        removed
    }

    pub fn get(&self, unique_name: &str) -> Option<Arc<dyn XaResourceProducer>> {
        self.producers.read().get(unique_name).cloned()
    }

    /// Every producer, sorted by unique name.
    pub fn producers(&self) -> Vec<Arc<dyn XaResourceProducer>> {
        self.producers.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.producers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.read().is_empty()
    }
}
