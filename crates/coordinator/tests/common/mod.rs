#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tandem_coordinator::{
    Configuration, JournalKind, PoolingProducer, TransactionManager, XaResourceProducer,
};
use tandem_journal_memory::MemoryJournal;
use tandem_pool::{ConnectionFactory, PoolError, PooledConnection};
use tandem_xa::flags::TMENDRSCAN;
use tandem_xa::{
    BranchStateRegistry, ResourceConfig, Vote, XaError, XaResource, XaResourceHolder, Xid,
};

/// Operations a test can script failures for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Start,
    End,
    Prepare,
    Commit,
    Rollback,
    Recover,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(Xid, i32),
    End(Xid, i32),
    Prepare(Xid),
    Commit(Xid, bool),
    Rollback(Xid),
    Forget(Xid),
    Recover(i32),
    SetTimeout(u32),
}

/// Shared, ordered log of "operation resource" entries across resources.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Scriptable XA resource that records every call.
pub struct MockXaResource {
    pub name: String,
    /// Resources of the same group talk to the same resource manager
    group: usize,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashMap<Op, VecDeque<XaError>>>,
    vote: Mutex<Vote>,
    delays: Mutex<HashMap<Op, Duration>>,
    in_doubt: Mutex<Vec<Xid>>,
    log: Option<EventLog>,
}

impl MockXaResource {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, usize::MAX, None)
    }

    pub fn with_log(name: &str, log: &EventLog) -> Arc<Self> {
        Self::build(name, usize::MAX, Some(log.clone()))
    }

    pub fn in_group(name: &str, group: usize) -> Arc<Self> {
        Self::build(name, group, None)
    }

    fn build(name: &str, group: usize, log: Option<EventLog>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            group,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            vote: Mutex::new(Vote::Ok),
            delays: Mutex::new(HashMap::new()),
            in_doubt: Mutex::new(Vec::new()),
            log,
        })
    }

    /// Fail the next call of `op` with `error`. Queued errors are used in order.
    pub fn fail_next(&self, op: Op, error: XaError) {
        self.failures.lock().entry(op).or_default().push_back(error);
    }

    pub fn set_vote(&self, vote: Vote) {
        *self.vote.lock() = vote;
    }

    pub fn set_delay(&self, op: Op, delay: Duration) {
        self.delays.lock().insert(op, delay);
    }

    pub fn add_in_doubt(&self, xid: Xid) {
        self.in_doubt.lock().push(xid);
    }

    pub fn in_doubt(&self) -> Vec<Xid> {
        self.in_doubt.lock().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn prepare_count(&self) -> usize {
        self.count(|call| matches!(call, Call::Prepare(_)))
    }

    /// `one_phase` flag of every commit call.
    pub fn commits(&self) -> Vec<bool> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Commit(_, one_phase) => Some(*one_phase),
                _ => None,
            })
            .collect()
    }

    pub fn rollback_count(&self) -> usize {
        self.count(|call| matches!(call, Call::Rollback(_)))
    }

    pub fn forget_count(&self) -> usize {
        self.count(|call| matches!(call, Call::Forget(_)))
    }

    /// XID of the first started branch.
    pub fn started_xid(&self) -> Option<Xid> {
        self.calls.lock().iter().find_map(|call| match call {
            Call::Start(xid, _) => Some(xid.clone()),
            _ => None,
        })
    }

    fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    async fn enter(&self, op: Op, call: Call) -> Result<(), XaError> {
        self.calls.lock().push(call);
        if let Some(log) = self.log.as_ref().filter(|_| op != Op::Recover) {
            log.lock()
                .push(format!("{} {}", format!("{:?}", op).to_lowercase(), self.name));
        }
        let delay = self.delays.lock().get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn resolve(&self, xid: &Xid) {
        self.in_doubt.lock().retain(|candidate| candidate != xid);
    }
}

#[async_trait]
impl XaResource for MockXaResource {
    async fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        self.enter(Op::Start, Call::Start(xid.clone(), flags)).await
    }

    async fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        self.enter(Op::End, Call::End(xid.clone(), flags)).await
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote, XaError> {
        self.enter(Op::Prepare, Call::Prepare(xid.clone())).await?;
        let vote = *self.vote.lock();
        if vote == Vote::Ok {
            self.in_doubt.lock().push(xid.clone());
        }
        Ok(vote)
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.enter(Op::Commit, Call::Commit(xid.clone(), one_phase)).await?;
        self.resolve(xid);
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.enter(Op::Rollback, Call::Rollback(xid.clone())).await?;
        self.resolve(xid);
        Ok(())
    }

    async fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        self.calls.lock().push(Call::Forget(xid.clone()));
        self.resolve(xid);
        Ok(())
    }

    async fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaError> {
        self.enter(Op::Recover, Call::Recover(flags)).await?;
        if flags == TMENDRSCAN {
            return Ok(Vec::new());
        }
        // Every scan call returns the full list, like most drivers
        Ok(self.in_doubt.lock().clone())
    }

    async fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, XaError> {
        self.calls.lock().push(Call::SetTimeout(seconds));
        Ok(true)
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        match other.as_any().downcast_ref::<MockXaResource>() {
            Some(other) if std::ptr::eq(self, other) => true,
            Some(other) => self.group != usize::MAX && self.group == other.group,
            None => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A bare holder of one mock resource.
pub struct MockHolder {
    pub resource: Arc<MockXaResource>,
    config: Arc<ResourceConfig>,
    states: BranchStateRegistry,
}

impl MockHolder {
    pub fn new(resource: Arc<MockXaResource>, config: ResourceConfig) -> Arc<Self> {
        Arc::new(Self {
            resource,
            config: Arc::new(config),
            states: BranchStateRegistry::new(),
        })
    }
}

impl XaResourceHolder for MockHolder {
    fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.resource.clone()
    }

    fn resource_config(&self) -> Arc<ResourceConfig> {
        self.config.clone()
    }

    fn branch_states(&self) -> &BranchStateRegistry {
        &self.states
    }
}

/// Producer handing out fixed holders, recovering through `recovery`.
pub struct MockProducer {
    config: Arc<ResourceConfig>,
    pub recovery: Arc<MockXaResource>,
    pub failed: AtomicBool,
    pub recovery_runs: AtomicUsize,
    pub closed: AtomicBool,
}

impl MockProducer {
    pub fn new(config: ResourceConfig, recovery: Arc<MockXaResource>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            recovery,
            failed: AtomicBool::new(false),
            recovery_runs: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl XaResourceProducer for MockProducer {
    fn unique_name(&self) -> &str {
        &self.config.unique_name
    }

    fn config(&self) -> Arc<ResourceConfig> {
        self.config.clone()
    }

    async fn start_recovery(&self) -> Result<Arc<dyn XaResource>, XaError> {
        self.recovery_runs.fetch_add(1, Ordering::SeqCst);
        Ok(self.recovery.clone())
    }

    async fn end_recovery(&self) -> Result<(), XaError> {
        Ok(())
    }

    fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A registered resource: its mock, a holder to enlist and its producer.
pub struct Resource {
    pub mock: Arc<MockXaResource>,
    pub holder: Arc<dyn XaResourceHolder>,
    pub producer: Arc<MockProducer>,
}

pub fn config() -> Configuration {
    Configuration::new("test-node")
        .with_journal(JournalKind::Memory)
        .with_default_transaction_timeout(Duration::from_secs(10))
        .with_background_recovery_interval(Duration::ZERO)
        .with_pool_shrink_interval(Duration::ZERO)
        .with_graceful_shutdown_interval(Duration::from_millis(200))
}

pub struct Fixture {
    pub manager: Arc<TransactionManager>,
    pub journal: Arc<MemoryJournal>,
}

pub async fn start() -> Fixture {
    start_with(config()).await
}

pub async fn start_with(config: Configuration) -> Fixture {
    start_with_journal(config, Arc::new(MemoryJournal::new())).await
}

pub async fn start_with_journal(config: Configuration, journal: Arc<MemoryJournal>) -> Fixture {
    let manager = TransactionManager::start_with_journal(config, journal.clone())
        .await
        .unwrap();
    Fixture { manager, journal }
}

impl Fixture {
    pub async fn add_resource(&self, name: &str) -> Resource {
        self.add_resource_with(ResourceConfig::new(name), MockXaResource::new(name))
            .await
    }

    pub async fn add_logged_resource(&self, config: ResourceConfig, log: &EventLog) -> Resource {
        let mock = MockXaResource::with_log(&config.unique_name, log);
        self.add_resource_with(config, mock).await
    }

    /// Register a producer whose recovery scans go to `mock` too.
    pub async fn add_resource_with(&self, config: ResourceConfig, mock: Arc<MockXaResource>) -> Resource {
        let producer = MockProducer::new(config.clone(), mock.clone());
        let holder = MockHolder::new(mock.clone(), config);
        self.manager.register_resource(producer.clone()).await.unwrap();
        Resource {
            mock,
            holder,
            producer,
        }
    }
}

/// Pooled connection whose resource is a fresh [`MockXaResource`].
pub struct MockConnection {
    pub serial: usize,
    pub resource: Arc<MockXaResource>,
    config: Arc<ResourceConfig>,
    states: BranchStateRegistry,
}

#[async_trait]
impl PooledConnection for MockConnection {
    type Handle = usize;

    async fn connection_handle(&self) -> tandem_pool::Result<usize> {
        Ok(self.serial)
    }

    async fn close(&self) -> tandem_pool::Result<()> {
        Ok(())
    }
}

impl XaResourceHolder for MockConnection {
    fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.resource.clone()
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
    pub resources: Arc<Mutex<Vec<Arc<MockXaResource>>>>,
    pub fail_creation: Arc<AtomicBool>,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn create_pooled_connection(
        &self,
        config: &ResourceConfig,
    ) -> tandem_pool::Result<MockConnection> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(PoolError::Creation {
                name: config.unique_name.clone(),
                message: "database down".to_string(),
            });
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst);
        // Connections of one factory talk to the same resource manager
        let resource = MockXaResource::in_group(&config.unique_name, 7);
        self.resources.lock().push(resource.clone());
        Ok(MockConnection {
            serial,
            resource,
            config: Arc::new(config.clone()),
            states: BranchStateRegistry::new(),
        })
    }
}

impl MockFactory {
    /// Resources created so far, in creation order.
    pub fn resources(&self) -> Vec<Arc<MockXaResource>> {
        self.resources.lock().clone()
    }
}

pub async fn pooling_producer(
    config: ResourceConfig,
    factory: MockFactory,
) -> Arc<PoolingProducer<MockFactory>> {
    PoolingProducer::new(config, factory).await.unwrap()
}
