//! XA transaction identifier

use serde::{Deserialize, Serialize};
use std::fmt;
use tandem_uid::Uid;

/// Format identifier of every Xid created by this transaction manager.
pub const FORMAT_ID: i32 = 0x5441_4E44;

/// Transaction branch identifier: global transaction id, branch qualifier
/// and format identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    gtrid: Uid,
    bqual: Uid,
}

impl Xid {
    /// Maximum length for global transaction ID.
    pub const MAXGTRIDSIZE: usize = 64;
    /// Maximum length for branch qualifier.
    pub const MAXBQUALSIZE: usize = 64;

    /// Identifier of a branch created by this transaction manager.
    pub fn new(gtrid: Uid, bqual: Uid) -> Self {
        Self::with_format(FORMAT_ID, gtrid, bqual)
    }

    /// Identifier with an arbitrary format, as reported by a resource during recovery.
    pub fn with_format(format_id: i32, gtrid: Uid, bqual: Uid) -> Self {
        Self {
            format_id,
            gtrid,
            bqual,
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Global transaction identifier.
    pub fn gtrid(&self) -> &Uid {
        &self.gtrid
    }

    /// Branch qualifier.
    pub fn bqual(&self) -> &Uid {
        &self.bqual
    }

    /// Whether this Xid uses our format id.
    pub fn is_ours(&self) -> bool {
        self.format_id == FORMAT_ID
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.format_id, self.gtrid, self.bqual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_equality_and_format() {
        let gtrid = Uid::from_parts(b"srv", 10, 1);
        let bqual = Uid::from_parts(b"srv", 10, 2);

        let ours = Xid::new(gtrid.clone(), bqual.clone());
        let foreign = Xid::with_format(42, gtrid.clone(), bqual.clone());

        assert!(ours.is_ours());
        assert!(!foreign.is_ours());
        assert_ne!(ours, foreign);
        assert_eq!(ours, Xid::new(gtrid, bqual));
    }

    #[test]
    fn test_display() {
        let xid = Xid::with_format(1, Uid::new(vec![0xab]), Uid::new(vec![0x01]));
        assert_eq!(xid.to_string(), "1:AB:01");
    }
}
