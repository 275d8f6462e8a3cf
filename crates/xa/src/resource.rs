//! Contract every transactional resource exposes to the coordinator.

use crate::error::XaError;
use crate::xid::Xid;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// Vote returned by a successful prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The branch has work to commit
    Ok,
    /// The branch did no work; it is already complete
    ReadOnly,
}

/// A resource that can take part in a two-phase commit.
///
/// Implementations wrap a vendor driver; failures are reported with an X/Open
/// error code that the coordinator maps onto its own error taxonomy.
#[async_trait]
pub trait XaResource: Send + Sync + 'static {
    /// Associate work with a branch.
    async fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError>;

    /// Dissociate work from a branch (TMSUCCESS, TMFAIL or TMSUSPEND).
    async fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaError>;

    /// First phase vote.
    async fn prepare(&self, xid: &Xid) -> Result<Vote, XaError>;

    /// Commit a branch, optionally skipping the prepare vote.
    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;

    /// Roll a branch back.
    async fn rollback(&self, xid: &Xid) -> Result<(), XaError>;

    /// Forget a heuristically completed branch.
    async fn forget(&self, xid: &Xid) -> Result<(), XaError>;

    /// List prepared branches (TMSTARTRSCAN, TMNOFLAGS, TMENDRSCAN).
    async fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaError>;

    /// Set the branch timeout in seconds; returns false if unsupported.
    async fn set_transaction_timeout(&self, _seconds: u32) -> Result<bool, XaError> {
        Ok(false)
    }

    /// Whether both resources talk to the same resource manager.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool;

    /// Downcasting support for `is_same_rm` implementations.
    fn as_any(&self) -> &dyn Any;
}

/// Identity comparison of two resource handles.
pub fn same_resource(a: &Arc<dyn XaResource>, b: &Arc<dyn XaResource>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
