//! Immutable byte identifiers used as GTRID and BQUAL.

use crate::error::{Result, UidError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Bytes taken by the timestamp component of a generated Uid.
pub const TIMESTAMP_LEN: usize = 8;

/// Bytes taken by the sequence component of a generated Uid.
pub const SEQUENCE_LEN: usize = 4;

/// Largest server id that still fits a 64-byte XA GTRID.
pub const MAX_SERVER_ID_LEN: usize = 64 - TIMESTAMP_LEN - SEQUENCE_LEN - 1;

struct UidInner {
    bytes: Box<[u8]>,
    hash: u32,
    hex: String,
}

/// Immutable identifier: `server_id || timestamp(8B) || sequence(4B)`.
///
/// Uids received from resources during recovery may have any layout; the
/// `extract_*` accessors only make sense for Uids built by a
/// [`UidGenerator`](crate::UidGenerator). Equality, ordering and hashing use
/// the byte content. Cloning is cheap.
#[derive(Clone)]
pub struct Uid(Arc<UidInner>);

impl Uid {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        let bytes = bytes.into();
        let hash = array_hash(&bytes);
        let hex = encode_hex(&bytes);
        Self(Arc::new(UidInner { bytes, hash, hex }))
    }

    /// Build a Uid from its three components.
    pub fn from_parts(server_id: &[u8], timestamp: u64, sequence: u32) -> Self {
        let mut bytes = Vec::with_capacity(server_id.len() + TIMESTAMP_LEN + SEQUENCE_LEN);
        bytes.extend_from_slice(server_id);
        bytes.extend_from_slice(&timestamp.to_be_bytes());
        bytes.extend_from_slice(&sequence.to_be_bytes());
        Self::new(bytes)
    }

    /// Parse the upper- or lower-case hex form produced by `Display`.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() % 2 != 0 {
            return Err(UidError::InvalidHex(hex.to_string()));
        }

        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| {
                hex.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| UidError::InvalidHex(hex.to_string()))
            })
            .collect::<Result<Vec<u8>>>()?;

        Ok(Self::new(bytes))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0.bytes
    }

    pub fn len(&self) -> usize {
        self.0.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.bytes.is_empty()
    }

    /// Cached upper-case hex representation.
    pub fn to_hex(&self) -> &str {
        &self.0.hex
    }

    /// Server id prefix, if this Uid is long enough to carry one.
    pub fn extract_server_id(&self) -> Option<&[u8]> {
        let len = self.len().checked_sub(TIMESTAMP_LEN + SEQUENCE_LEN)?;
        Some(&self.0.bytes[..len])
    }

    /// Timestamp component in milliseconds.
    pub fn extract_timestamp(&self) -> Option<u64> {
        let start = self.len().checked_sub(TIMESTAMP_LEN + SEQUENCE_LEN)?;
        let raw: [u8; TIMESTAMP_LEN] = self.0.bytes[start..start + TIMESTAMP_LEN]
            .try_into()
            .ok()?;
        Some(u64::from_be_bytes(raw))
    }

    /// Sequence component.
    pub fn extract_sequence(&self) -> Option<u32> {
        let start = self.len().checked_sub(SEQUENCE_LEN)?;
        let raw: [u8; SEQUENCE_LEN] = self.0.bytes[start..].try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }
}

impl PartialEq for Uid {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.hash == other.0.hash && self.0.bytes == other.0.bytes)
    }
}

impl Eq for Uid {}

impl Hash for Uid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0.hash);
    }
}

impl PartialOrd for Uid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Uid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.bytes.cmp(&other.0.bytes)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.hex)
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.0.hex)
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Uid::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

fn array_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(1u32, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u32))
}

fn encode_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}
