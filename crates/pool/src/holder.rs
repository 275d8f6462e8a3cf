//! Pooled connection contract and lifecycle states

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_xa::{ResourceConfig, XaResourceHolder};

/// Lifecycle state of a pooled connection.
///
/// `Closed` is terminal: a closed slot is replaced by a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HolderState {
    /// Idle, ready to be handed out
    InPool,
    /// Handed out to client code
    Accessible,
    /// Closed by client code but still bound to a transaction
    NotAccessible,
    Closed,
}

impl fmt::Display for HolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HolderState::InPool => "IN_POOL",
            HolderState::Accessible => "ACCESSIBLE",
            HolderState::NotAccessible => "NOT_ACCESSIBLE",
            HolderState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Observer of pooled connection state changes.
///
/// Called with the pool lock held; implementations must not block.
pub trait StateChangeListener: Send + Sync {
    fn state_changing(&self, _id: u64, _from: HolderState, _to: HolderState) {}

    fn state_changed(&self, _id: u64, _from: HolderState, _to: HolderState) {}
}

/// A physical connection owned by a pool.
#[async_trait]
pub trait PooledConnection: XaResourceHolder {
    /// What client code works with while the connection is accessible
    type Handle: Send + 'static;

    /// Produce a handle for client code. Failure evicts the connection.
    async fn connection_handle(&self) -> Result<Self::Handle>;

    /// Close the physical connection.
    async fn close(&self) -> Result<()>;
}

/// Creates physical connections for a pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: PooledConnection;

    async fn create_pooled_connection(&self, config: &ResourceConfig)
    -> Result<Self::Connection>;
}

/// Invoked after a failed pool has been reset, before it serves acquisitions again.
#[async_trait]
pub trait PoolRecoveryHook: Send + Sync {
    async fn recover_pool(&self, unique_name: &str) -> std::result::Result<(), String>;
}
