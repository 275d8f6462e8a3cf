use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tandem_pool::{ConnectionFactory, PoolError, PooledConnection};
use tandem_xa::{
    BranchStateRegistry, ResourceConfig, Vote, XaError, XaResource, XaResourceHolder, Xid,
};

#[derive(Default)]
pub struct NoopResource;

#[async_trait]
impl XaResource for NoopResource {
    async fn start(&self, _xid: &Xid, _flags: i32) -> Result<(), XaError> {
        Ok(())
    }

    async fn end(&self, _xid: &Xid, _flags: i32) -> Result<(), XaError> {
        Ok(())
    }

    async fn prepare(&self, _xid: &Xid) -> Result<Vote, XaError> {
        Ok(Vote::Ok)
    }

    async fn commit(&self, _xid: &Xid, _one_phase: bool) -> Result<(), XaError> {
        Ok(())
    }

    async fn rollback(&self, _xid: &Xid) -> Result<(), XaError> {
        Ok(())
    }

    async fn forget(&self, _xid: &Xid) -> Result<(), XaError> {
        Ok(())
    }

    async fn recover(&self, _flags: i32) -> Result<Vec<Xid>, XaError> {
        Ok(Vec::new())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        std::ptr::addr_eq(self as *const Self, other.as_any() as *const dyn Any)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MockConnection {
    pub serial: usize,
    xa: Arc<dyn XaResource>,
    config: Arc<ResourceConfig>,
    states: BranchStateRegistry,
    pub broken: AtomicBool,
    pub closed: AtomicBool,
}

#[async_trait]
impl PooledConnection for MockConnection {
    type Handle = usize;

    async fn connection_handle(&self) -> tandem_pool::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(PoolError::Handle {
                name: self.config.unique_name.clone(),
                message: "connection reset".to_string(),
            });
        }
        Ok(self.serial)
    }

    async fn close(&self) -> tandem_pool::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl XaResourceHolder for MockConnection {
    fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.xa.clone()
    }

    fn resource_config(&self) -> Arc<ResourceConfig> {
        self.config.clone()
    }

    fn branch_states(&self) -> &BranchStateRegistry {
        &self.states
    }
}

#[derive(Clone, Default)]
pub struct MockFactory {
    pub created: Arc<AtomicUsize>,
    /// Serial numbers whose connections hand out failing handles
    pub broken_serials: Arc<Mutex<Vec<usize>>>,
    pub fail_creation: Arc<AtomicBool>,
    pub creation_delay: Arc<Mutex<Duration>>,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn create_pooled_connection(
        &self,
        config: &ResourceConfig,
    ) -> tandem_pool::Result<MockConnection> {
        let delay = *self.creation_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(PoolError::Creation {
                name: config.unique_name.clone(),
                message: "database down".to_string(),
            });
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        let broken = self.broken_serials.lock().contains(&serial);
        Ok(MockConnection {
            serial,
            xa: Arc::new(NoopResource),
            config: Arc::new(config.clone()),
            states: BranchStateRegistry::new(),
            broken: AtomicBool::new(broken),
            closed: AtomicBool::new(false),
        })
    }
}
