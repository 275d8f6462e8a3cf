//! X/Open XA building blocks shared by the pool and the coordinator.
//!
//! - `Xid`, flags and the XA error codes
//! - The `XaResource` contract resources implement
//! - Per-branch state kept by every resource holder
//! - Transaction `Status` and its legal transitions
//! - `ResourceConfig`, the per-resource settings

pub mod branch;
pub mod config;
pub mod error;
pub mod flags;
pub mod resource;
pub mod status;
pub mod xid;

pub use branch::{BranchState, BranchStateRegistry, XaResourceHolder};
pub use config::ResourceConfig;
pub use error::{HeuristicKind, XaError};
pub use resource::{Vote, XaResource, same_resource};
pub use status::Status;
pub use xid::{FORMAT_ID, Xid};
