//! Branch bookkeeping of one global transaction

use crate::error::{Phase, TransactionError};
use std::sync::Arc;
use std::time::Duration;
use tandem_scheduler::Scheduler;
use tandem_uid::{Uid, UidGenerator};
use tandem_xa::flags::{TMJOIN, TMNOFLAGS, TMRESUME, TMSUSPEND};
use tandem_xa::{BranchState, XaError, Xid, same_resource};

/// How a branch state ended up enlisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enlistment {
    /// A new branch was started
    Started(Xid),
    /// The branch joined an ended branch of the same resource manager
    Joined(Xid),
    /// The resource was already enlisted and not ended; nothing was done
    AlreadyEnlisted(Xid),
}

/// Owns the branches of one GTRID, ordered by two-phase commit position.
pub struct XaResourceManager {
    gtrid: Uid,
    generator: Arc<UidGenerator>,
    resources: Scheduler<Arc<BranchState>>,
    /// States replaced by a joining branch; kept for holder cleanup
    retired: Vec<Arc<BranchState>>,
}

impl XaResourceManager {
    pub fn new(gtrid: Uid, generator: Arc<UidGenerator>) -> Self {
        Self {
            gtrid,
            generator,
            resources: Scheduler::new(),
            retired: Vec::new(),
        }
    }

    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    pub fn size(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Enlisted states in natural order.
    pub fn all_states(&self) -> Vec<Arc<BranchState>> {
        self.resources.natural_order_iter().cloned().collect()
    }

    /// Enlisted states plus the ones that were joined by a later branch.
    pub fn every_state(&self) -> Vec<Arc<BranchState>> {
        self.resources
            .natural_order_iter()
            .chain(self.retired.iter())
            .cloned()
            .collect()
    }

    /// Enlisted state using exactly this resource, if any.
    fn find_by_resource(&self, state: &BranchState) -> Option<Arc<BranchState>> {
        self.resources
            .natural_order_iter()
            .find(|enlisted| same_resource(enlisted.xa_resource(), state.xa_resource()))
            .cloned()
    }

    /// Ended, non-suspended state of the same resource manager.
    fn find_joinable(&self, state: &BranchState) -> Option<Arc<BranchState>> {
        self.resources
            .natural_order_iter()
            .find(|enlisted| {
                enlisted.is_ended()
                    && !enlisted.is_suspended()
                    && enlisted
                        .xa_resource()
                        .is_same_rm(state.xa_resource().as_ref())
            })
            .cloned()
    }

    /// Start a branch for `state`, joining a compatible one when allowed.
    ///
    /// `remaining` is passed to the resource when it asks for the transaction
    /// timeout to be applied.
    pub async fn enlist(
        &mut self,
        state: Arc<BranchState>,
        remaining: Duration,
    ) -> Result<Enlistment, XaError> {
        if let Some(enlisted) = self.find_by_resource(&state)
            && !enlisted.is_ended()
            && let Some(xid) = enlisted.xid()
        {
            tracing::debug!(
                "ignoring enlistment of already enlisted resource {} in {}",
                state.unique_name(),
                self.gtrid
            );
            state.set_xid(xid.clone());
            return Ok(Enlistment::AlreadyEnlisted(xid));
        }

        let joinable = if state.config().use_tm_join {
            self.find_joinable(&state)
        } else {
            None
        };

        let (xid, flags) = match joinable.as_ref().and_then(|joined| joined.xid()) {
            Some(xid) => (xid, TMJOIN),
            None => (
                Xid::new(self.gtrid.clone(), self.generator.generate_uid()),
                TMNOFLAGS,
            ),
        };
        state.set_xid(xid.clone());

        if flags == TMNOFLAGS && state.config().apply_transaction_timeout {
            let seconds = remaining.as_secs().clamp(1, u32::MAX as u64) as u32;
            if !state.xa_resource().set_transaction_timeout(seconds).await? {
                tracing::debug!(
                    "resource {} does not support transaction timeouts",
                    state.unique_name()
                );
            }
        }

        state.start(flags).await?;

        // A joined branch replaces the state it joined
        if let Some(joined) = joinable
            && let Ok(joined) = self.resources.remove(&joined)
        {
            self.retired.push(joined);
        }
        self.resources
            .add(state.clone(), state.two_pc_ordering_position());

        Ok(if flags == TMJOIN {
            Enlistment::Joined(xid)
        } else {
            Enlistment::Started(xid)
        })
    }

    /// End a branch with TMSUCCESS, TMFAIL or TMSUSPEND.
    pub async fn delist(&mut self, state: &Arc<BranchState>, flags: i32) -> Result<(), XaError> {
        if !self.resources.contains(state) {
            return Err(XaError::protocol(format!(
                "resource {} is not enlisted in {}",
                state.unique_name(),
                self.gtrid
            )));
        }
        state.end(flags).await
    }

    /// Suspend every active branch.
    pub async fn suspend(&mut self) -> crate::error::Result<()> {
        for state in self.all_states() {
            if state.is_active() {
                state.end(TMSUSPEND).await.map_err(|e| {
                    TransactionError::resource(Phase::Suspend, state.unique_name(), e)
                })?;
            }
        }
        Ok(())
    }

    /// Resume every suspended branch.
    pub async fn resume(&mut self) -> crate::error::Result<()> {
        for state in self.all_states() {
            if state.is_suspended() {
                state.start(TMRESUME).await.map_err(|e| {
                    TransactionError::resource(Phase::Resume, state.unique_name(), e)
                })?;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.resources.clear();
        self.retired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::any::Any;
    use tandem_xa::flags::TMSUCCESS;
    use tandem_xa::{ResourceConfig, Vote, XaResource};

    /// Resource recording start flags; `rm` identifies its resource manager.
    struct Recorder {
        rm: u8,
        starts: Mutex<Vec<i32>>,
        timeouts: Mutex<Vec<u32>>,
    }

    impl Recorder {
        fn new(rm: u8) -> Arc<Self> {
            Arc::new(Self {
                rm,
                starts: Mutex::new(Vec::new()),
                timeouts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl XaResource for Recorder {
        async fn start(&self, _xid: &Xid, flags: i32) -> Result<(), XaError> {
            self.starts.lock().push(flags);
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

        async fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, XaError> {
            self.timeouts.lock().push(seconds);
            Ok(true)
        }

        fn is_same_rm(&self, other: &dyn XaResource) -> bool {
            other
                .as_any()
                .downcast_ref::<Recorder>()
                .is_some_and(|other| other.rm == self.rm)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn manager() -> XaResourceManager {
        let generator = Arc::new(UidGenerator::new("rm-test").unwrap());
        XaResourceManager::new(generator.generate_uid(), generator)
    }

    fn state(resource: &Arc<Recorder>, config: ResourceConfig) -> Arc<BranchState> {
        Arc::new(BranchState::for_resource(resource.clone(), Arc::new(config)))
    }

    const REMAINING: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_enlist_starts_distinct_branches() {
        let mut rm = manager();
        let a = Recorder::new(1);
        let b = Recorder::new(2);

        let first = rm.enlist(state(&a, ResourceConfig::new("a")), REMAINING);
        let Enlistment::Started(xid_a) = first.await.unwrap() else {
            panic!("expected a new branch");
        };
        let second = rm.enlist(state(&b, ResourceConfig::new("b")), REMAINING);
        let Enlistment::Started(xid_b) = second.await.unwrap() else {
            panic!("expected a new branch");
        };

        assert_eq!(xid_a.gtrid(), rm.gtrid());
        assert_eq!(xid_a.gtrid(), xid_b.gtrid());
        assert_ne!(xid_a.bqual(), xid_b.bqual());
        assert_eq!(rm.size(), 2);
        assert_eq!(*a.starts.lock(), vec![TMNOFLAGS]);
        assert!(a.timeouts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_enlisting_active_resource_again_does_nothing() {
        let mut rm = manager();
        let a = Recorder::new(1);

        rm.enlist(state(&a, ResourceConfig::new("a")), REMAINING).await.unwrap();
        let again = rm
            .enlist(state(&a, ResourceConfig::new("a")), REMAINING)
            .await
            .unwrap();

        assert!(matches!(again, Enlistment::AlreadyEnlisted(_)));
        assert_eq!(rm.size(), 1);
        assert_eq!(a.starts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_join_replaces_ended_branch_of_same_rm() {
        let mut rm = manager();
        let first = Recorder::new(1);
        let second = Recorder::new(1);

        let started = state(&first, ResourceConfig::new("a"));
        rm.enlist(started.clone(), REMAINING).await.unwrap();
        rm.delist(&started, TMSUCCESS).await.unwrap();

        let joined = rm
            .enlist(state(&second, ResourceConfig::new("a")), REMAINING)
            .await
            .unwrap();
        assert_eq!(joined, Enlistment::Joined(started.xid().unwrap()));
        assert_eq!(*second.starts.lock(), vec![TMJOIN]);
        assert_eq!(rm.size(), 1);
        assert_eq!(rm.every_state().len(), 2);
    }

    #[tokio::test]
    async fn test_no_join_when_disabled() {
        let mut rm = manager();
        let first = Recorder::new(1);
        let second = Recorder::new(1);
        let config = ResourceConfig::new("a").with_use_tm_join(false);

        let started = state(&first, config.clone());
        rm.enlist(started.clone(), REMAINING).await.unwrap();
        rm.delist(&started, TMSUCCESS).await.unwrap();

        let enlisted = rm.enlist(state(&second, config), REMAINING).await.unwrap();
        assert!(matches!(enlisted, Enlistment::Started(_)));
        assert_eq!(rm.size(), 2);
    }

    #[tokio::test]
    async fn test_transaction_timeout_applied_on_start() {
        let mut rm = manager();
        let a = Recorder::new(1);
        let config = ResourceConfig::new("a").with_apply_transaction_timeout(true);

        rm.enlist(state(&a, config), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(*a.timeouts.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_delist_unknown_state_is_a_protocol_error() {
        let mut rm = manager();
        let a = Recorder::new(1);
        let stray = state(&a, ResourceConfig::new("a"));
        stray.set_xid(Xid::new(rm.gtrid().clone(), rm.gtrid().clone()));

        let err = rm.delist(&stray, TMSUCCESS).await.unwrap_err();
        assert_eq!(err.code, tandem_xa::error::XAER_PROTO);
    }

    #[tokio::test]
    async fn test_suspend_and_resume_active_branches() {
        let mut rm = manager();
        let a = Recorder::new(1);
        let enlisted = state(&a, ResourceConfig::new("a"));
        rm.enlist(enlisted.clone(), REMAINING).await.unwrap();

        rm.suspend().await.unwrap();
        assert!(enlisted.is_suspended());
        rm.resume().await.unwrap();
        assert!(enlisted.is_active());
        assert_eq!(*a.starts.lock(), vec![TMNOFLAGS, TMRESUME]);
    }
}
