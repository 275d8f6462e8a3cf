//! Per (transaction, resource) branch bookkeeping.

use crate::config::ResourceConfig;
use crate::error::XaError;
use crate::flags::{TMFAIL, TMJOIN, TMRESUME, TMSUCCESS, TMSUSPEND, decode_flags};
use crate::resource::{Vote, XaResource};
use crate::xid::Xid;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use tandem_uid::Uid;

/// Something that owns a live XA resource: usually a pooled connection.
pub trait XaResourceHolder: Send + Sync + 'static {
    /// The resource branches are started on.
    fn xa_resource(&self) -> Arc<dyn XaResource>;

    /// Configuration of the resource this holder belongs to.
    fn resource_config(&self) -> Arc<ResourceConfig>;

    /// Branch states of every transaction this holder takes part in.
    fn branch_states(&self) -> &BranchStateRegistry;
}

#[derive(Debug, Default, Clone)]
struct BranchFlags {
    xid: Option<Xid>,
    started: bool,
    ended: bool,
    suspended: bool,
    // Shares its xid with another state of the same resource manager
    joined: bool,
}

/// State of one resource's participation in one global transaction.
///
/// A branch participates in an active global transaction iff it is started,
/// not suspended and not ended.
pub struct BranchState {
    xa_resource: Arc<dyn XaResource>,
    holder: Option<Weak<dyn XaResourceHolder>>,
    config: Arc<ResourceConfig>,
    flags: Mutex<BranchFlags>,
}

impl BranchState {
    /// Create a fresh, unstarted state for a holder.
    pub fn new(holder: &Arc<dyn XaResourceHolder>) -> Self {
        Self {
            xa_resource: holder.xa_resource(),
            holder: Some(Arc::downgrade(holder)),
            config: holder.resource_config(),
            flags: Mutex::new(BranchFlags::default()),
        }
    }

    /// Create a state for a bare resource, with no owning holder.
    pub fn for_resource(xa_resource: Arc<dyn XaResource>, config: Arc<ResourceConfig>) -> Self {
        Self {
            xa_resource,
            holder: None,
            config,
            flags: Mutex::new(BranchFlags::default()),
        }
    }

    pub fn xa_resource(&self) -> &Arc<dyn XaResource> {
        &self.xa_resource
    }

    pub fn config(&self) -> &Arc<ResourceConfig> {
        &self.config
    }

    pub fn unique_name(&self) -> &str {
        &self.config.unique_name
    }

    pub fn two_pc_ordering_position(&self) -> i32 {
        self.config.two_pc_ordering_position
    }

    /// Owning holder, if it is still alive.
    pub fn holder(&self) -> Option<Arc<dyn XaResourceHolder>> {
        self.holder.as_ref().and_then(Weak::upgrade)
    }

    pub fn xid(&self) -> Option<Xid> {
        self.flags.lock().xid.clone()
    }

    pub fn set_xid(&self, xid: Xid) {
        self.flags.lock().xid = Some(xid);
    }

    pub fn is_started(&self) -> bool {
        self.flags.lock().started
    }

    pub fn is_ended(&self) -> bool {
        self.flags.lock().ended
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.lock().suspended
    }

    /// Started, not suspended, not ended.
    pub fn is_active(&self) -> bool {
        let flags = self.flags.lock();
        flags.started && !flags.suspended && !flags.ended
    }

    /// Timestamp and sequence of the branch qualifier, used to find the most
    /// recent of several branches of the same resource.
    pub fn branch_age(&self) -> Option<(u64, u32)> {
        let flags = self.flags.lock();
        let bqual = flags.xid.as_ref()?.bqual();
        Some((bqual.extract_timestamp()?, bqual.extract_sequence()?))
    }

    fn require_xid(&self) -> Result<Xid, XaError> {
        self.xid().ok_or_else(|| {
            XaError::protocol(format!(
                "no XID assigned to branch of resource {}",
                self.unique_name()
            ))
        })
    }

    /// Start (or join, or resume) the branch.
    pub async fn start(&self, flags: i32) -> Result<(), XaError> {
        let xid = self.require_xid()?;
        {
            let state = self.flags.lock();
            if flags == TMRESUME && !state.suspended {
                return Err(XaError::protocol(format!(
                    "cannot resume non-suspended branch {} on {}",
                    xid,
                    self.unique_name()
                )));
            }
            if flags != TMRESUME && state.started && !state.ended && !state.suspended {
                return Err(XaError::protocol(format!(
                    "branch {} on {} is already started",
                    xid,
                    self.unique_name()
                )));
            }
        }

        tracing::debug!(
            "starting branch {} on {} with {}",
            xid,
            self.unique_name(),
            decode_flags(flags)
        );
        self.xa_resource.start(&xid, flags).await?;

        let mut state = self.flags.lock();
        state.started = true;
        state.ended = false;
        state.suspended = false;
        if flags == TMJOIN {
            state.joined = true;
        }
        Ok(())
    }

    /// End the branch with TMSUCCESS, TMFAIL or TMSUSPEND.
    pub async fn end(&self, flags: i32) -> Result<(), XaError> {
        let xid = self.require_xid()?;
        if !matches!(flags, TMSUCCESS | TMFAIL | TMSUSPEND) {
            return Err(XaError::new(
                crate::error::XAER_INVAL,
                format!("invalid end flags {}", decode_flags(flags)),
            ));
        }
        {
            let state = self.flags.lock();
            if !state.started || state.ended {
                return Err(XaError::protocol(format!(
                    "branch {} on {} is not started",
                    xid,
                    self.unique_name()
                )));
            }
            if flags == TMSUSPEND && state.suspended {
                return Err(XaError::protocol(format!(
                    "branch {} on {} is already suspended",
                    xid,
                    self.unique_name()
                )));
            }
        }

        tracing::debug!(
            "ending branch {} on {} with {}",
            xid,
            self.unique_name(),
            decode_flags(flags)
        );
        let result = self.xa_resource.end(&xid, flags).await;

        // A rollback reported by end still dissociates the branch
        if result.is_ok() || result.as_ref().is_err_and(XaError::is_rollback) {
            let mut state = self.flags.lock();
            if flags == TMSUSPEND && result.is_ok() {
                state.suspended = true;
            } else {
                state.ended = true;
                state.suspended = false;
            }
        }
        result
    }

    pub async fn prepare(&self) -> Result<Vote, XaError> {
        let xid = self.require_xid()?;
        self.xa_resource.prepare(&xid).await
    }

    pub async fn commit(&self, one_phase: bool) -> Result<(), XaError> {
        let xid = self.require_xid()?;
        self.xa_resource.commit(&xid, one_phase).await
    }

    pub async fn rollback(&self) -> Result<(), XaError> {
        let xid = self.require_xid()?;
        self.xa_resource.rollback(&xid).await
    }

    pub async fn forget(&self) -> Result<(), XaError> {
        let xid = self.require_xid()?;
        self.xa_resource.forget(&xid).await
    }
}

impl fmt::Debug for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = self.flags.lock();
        f.debug_struct("BranchState")
            .field("resource", &self.config.unique_name)
            .field("xid", &flags.xid)
            .field("started", &flags.started)
            .field("ended", &flags.ended)
            .field("suspended", &flags.suspended)
            .field("joined", &flags.joined)
            .finish()
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.xid() {
            Some(xid) => write!(f, "branch {} of {}", xid, self.unique_name()),
            None => write!(f, "unstarted branch of {}", self.unique_name()),
        }
    }
}

/// Branch states of one holder, keyed by GTRID then BQUAL.
#[derive(Default)]
pub struct BranchStateRegistry {
    states: Mutex<HashMap<Uid, BTreeMap<Uid, Arc<BranchState>>>>,
}

impl BranchStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a state under its XID.
    pub fn put(&self, xid: &Xid, state: Arc<BranchState>) {
        self.states
            .lock()
            .entry(xid.gtrid().clone())
            .or_default()
            .insert(xid.bqual().clone(), state);
    }

    /// Forget the state of one branch.
    pub fn remove(&self, xid: &Xid) -> Option<Arc<BranchState>> {
        let mut states = self.states.lock();
        let branches = states.get_mut(xid.gtrid())?;
        let removed = branches.remove(xid.bqual());
        if branches.is_empty() {
            states.remove(xid.gtrid());
        }
        removed
    }

    /// Forget every state of one transaction.
    pub fn remove_gtrid(&self, gtrid: &Uid) -> Vec<Arc<BranchState>> {
        self.states
            .lock()
            .remove(gtrid)
            .map(|branches| branches.into_values().collect())
            .unwrap_or_default()
    }

    /// States of one transaction, oldest branch first.
    pub fn states_for_gtrid(&self, gtrid: &Uid) -> Vec<Arc<BranchState>> {
        let mut states: Vec<Arc<BranchState>> = self
            .states
            .lock()
            .get(gtrid)
            .map(|branches| branches.values().cloned().collect())
            .unwrap_or_default();
        states.sort_by_key(|state| state.branch_age());
        states
    }

    /// Most recent state of one transaction, judged by BQUAL timestamp.
    pub fn latest_state_for_gtrid(&self, gtrid: &Uid) -> Option<Arc<BranchState>> {
        self.states_for_gtrid(gtrid).pop()
    }

    pub fn has_state_for_gtrid(&self, gtrid: &Uid) -> bool {
        self.states.lock().contains_key(gtrid)
    }

    /// Whether any branch of this holder is started, not suspended and not ended.
    pub fn is_participating_in_active_global_transaction(&self) -> bool {
        self.states
            .lock()
            .values()
            .flat_map(|branches| branches.values())
            .any(|state| state.is_active())
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }
}
