//! Pooling of XA-capable connections
//!
//! A pooled connection moves between `InPool`, `Accessible`,
//! `NotAccessible` and `Closed`. Connections still bound to a running
//! transaction stay `NotAccessible` and can be recycled by that transaction.

mod error;
mod holder;
mod pool;

pub use error::{PoolError, Result};
pub use holder::{
    ConnectionFactory, HolderState, PoolRecoveryHook, PooledConnection, StateChangeListener,
};
pub use pool::{Lease, PoolStatistics, XaPool};
