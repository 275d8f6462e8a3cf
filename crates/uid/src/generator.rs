//! Globally unique identifier generation.

use crate::clock::MonotonicClock;
use crate::error::{Result, UidError};
use crate::uid::{MAX_SERVER_ID_LEN, Uid};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Generates Uids made of this node's server id, a monotonic timestamp and a
/// per-generator sequence number.
#[derive(Debug)]
pub struct UidGenerator {
    server_id: Box<[u8]>,
    clock: Arc<MonotonicClock>,
    sequence: AtomicU32,
}

impl UidGenerator {
    /// Create a generator using the process-wide monotonic clock.
    ///
    /// Server ids longer than [`MAX_SERVER_ID_LEN`] bytes are truncated.
    pub fn new(server_id: &str) -> Result<Self> {
        Self::with_clock(server_id, MonotonicClock::global())
    }

    /// Create a generator with its own clock.
    pub fn with_clock(server_id: &str, clock: Arc<MonotonicClock>) -> Result<Self> {
        Ok(Self {
            server_id: normalize_server_id(server_id)?,
            clock,
            sequence: AtomicU32::new(0),
        })
    }

    /// Server id bytes embedded in every generated Uid.
    pub fn server_id(&self) -> &[u8] {
        &self.server_id
    }

    /// Generate a new unique identifier.
    pub fn generate_uid(&self) -> Uid {
        let timestamp = self.clock.now_millis();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        Uid::from_parts(&self.server_id, timestamp, sequence)
    }
}

/// Validate and, if needed, truncate a server id.
pub fn normalize_server_id(server_id: &str) -> Result<Box<[u8]>> {
    if server_id.is_empty() {
        return Err(UidError::InvalidServerId(
            "server id must not be empty".to_string(),
        ));
    }
    if !server_id.is_ascii() {
        return Err(UidError::InvalidServerId(format!(
            "server id '{}' must be ASCII",
            server_id
        )));
    }

    let bytes = server_id.as_bytes();
    if bytes.len() > MAX_SERVER_ID_LEN {
        let truncated = &bytes[..MAX_SERVER_ID_LEN];
        tracing::warn!(
            "server id '{}' is longer than {} bytes, truncating to '{}'",
            server_id,
            MAX_SERVER_ID_LEN,
            String::from_utf8_lossy(truncated)
        );
        return Ok(truncated.into());
    }

    Ok(bytes.into())
}
