//! Error types for the pool

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("pool {0} is closed")]
    Closed(String),

    #[error(
        "unable to get a connection from pool {name} within {timeout:?} ({in_pool} in pool, {total} total)"
    )]
    Timeout {
        name: String,
        timeout: Duration,
        in_pool: usize,
        total: usize,
    },

    #[error("cannot create a pooled connection for {name}: {message}")]
    Creation { name: String, message: String },

    #[error("cannot get a connection handle from {name}: {message}")]
    Handle { name: String, message: String },

    #[error("recovery of failed pool {name} failed: {message}")]
    Recovery { name: String, message: String },

    #[error("no pooled connection with id {0}")]
    UnknownConnection(u64),

    #[error("invalid pool configuration: {0}")]
    Configuration(String),
}
