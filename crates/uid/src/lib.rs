//! Unique identifiers for transactions and branches.
//!
//! This crate provides:
//! - A strictly increasing millisecond clock that tolerates wall-clock jumps
//! - `Uid`, the byte identifier used as GTRID and BQUAL
//! - `UidGenerator`, which builds Uids from server id, timestamp and sequence

mod clock;
mod error;
mod generator;
mod uid;

pub use clock::{MonotonicClock, TimeSource};
pub use error::{Result, UidError};
pub use generator::{UidGenerator, normalize_server_id};
pub use uid::{MAX_SERVER_ID_LEN, SEQUENCE_LEN, TIMESTAMP_LEN, Uid};
