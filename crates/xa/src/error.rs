//! XA return and error codes, and the error type resources report.

use std::fmt;

/// Normal execution.
pub const XA_OK: i32 = 0;

/// The transaction branch was read-only and has been committed.
pub const XA_RDONLY: i32 = 3;

/// Routine returned with no effect and may be reissued.
pub const XA_RETRY: i32 = 4;

/// The transaction work was partially committed and partially rolled back.
pub const XA_HEURMIX: i32 = 5;

/// The transaction work was rolled back (heuristically).
pub const XA_HEURRB: i32 = 6;

/// The transaction work was committed (heuristically).
pub const XA_HEURCOM: i32 = 7;

/// The transaction work may have been committed or rolled back.
pub const XA_HEURHAZ: i32 = 8;

/// Resumption must occur where suspension occurred.
pub const XA_NOMIGRATE: i32 = 9;

/// Lower bound of rollback codes.
pub const XA_RBBASE: i32 = 100;

/// Rollback was caused by unspecified reason.
pub const XA_RBROLLBACK: i32 = XA_RBBASE;

/// Rollback was caused by communication failure.
pub const XA_RBCOMMFAIL: i32 = XA_RBBASE + 1;

/// A deadlock was detected.
pub const XA_RBDEADLOCK: i32 = XA_RBBASE + 2;

/// A condition that violates the integrity of the resource was detected.
pub const XA_RBINTEGRITY: i32 = XA_RBBASE + 3;

/// The resource manager rolled back for a reason not listed.
pub const XA_RBOTHER: i32 = XA_RBBASE + 4;

/// A protocol error occurred in the resource manager.
pub const XA_RBPROTO: i32 = XA_RBBASE + 5;

/// A transaction branch took too long.
pub const XA_RBTIMEOUT: i32 = XA_RBBASE + 6;

/// May retry the transaction branch.
pub const XA_RBTRANSIENT: i32 = XA_RBBASE + 7;

/// Upper bound of rollback codes.
pub const XA_RBEND: i32 = XA_RBTRANSIENT;

/// Asynchronous operation already outstanding.
pub const XAER_ASYNC: i32 = -2;

/// A resource manager error occurred in the transaction branch.
pub const XAER_RMERR: i32 = -3;

/// The XID is not valid.
pub const XAER_NOTA: i32 = -4;

/// Invalid arguments were given.
pub const XAER_INVAL: i32 = -5;

/// Routine invoked in an improper context.
pub const XAER_PROTO: i32 = -6;

/// Resource manager unavailable.
pub const XAER_RMFAIL: i32 = -7;

/// The XID already exists.
pub const XAER_DUPID: i32 = -8;

/// Resource manager doing work outside a global transaction.
pub const XAER_OUTSIDE: i32 = -9;

/// Heuristic decision reported by a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeuristicKind {
    Commit,
    Rollback,
    Mixed,
    Hazard,
}

/// Failure reported by a transactional resource, carrying its XA code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XaError {
    pub code: i32,
    pub message: String,
}

impl XaError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Resource manager unavailable.
    pub fn rm_fail(message: impl Into<String>) -> Self {
        Self::new(XAER_RMFAIL, message)
    }

    /// Resource manager error.
    pub fn rm_err(message: impl Into<String>) -> Self {
        Self::new(XAER_RMERR, message)
    }

    /// Routine invoked in an improper context.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(XAER_PROTO, message)
    }

    /// Unknown XID.
    pub fn not_a(message: impl Into<String>) -> Self {
        Self::new(XAER_NOTA, message)
    }

    /// The branch was rolled back by the resource.
    pub fn rolled_back(message: impl Into<String>) -> Self {
        Self::new(XA_RBROLLBACK, message)
    }

    /// One of the `XA_RB*` codes: the resource already rolled the branch back.
    pub fn is_rollback(&self) -> bool {
        (XA_RBBASE..=XA_RBEND).contains(&self.code)
    }

    /// The resource does not know the XID.
    pub fn is_not_a(&self) -> bool {
        self.code == XAER_NOTA
    }

    /// The resource is unreachable; the branch outcome is unknown.
    pub fn is_rm_fail(&self) -> bool {
        self.code == XAER_RMFAIL
    }

    /// Heuristic decision carried by this error, if any.
    pub fn heuristic(&self) -> Option<HeuristicKind> {
        match self.code {
            XA_HEURCOM => Some(HeuristicKind::Commit),
            XA_HEURRB => Some(HeuristicKind::Rollback),
            XA_HEURMIX => Some(HeuristicKind::Mixed),
            XA_HEURHAZ => Some(HeuristicKind::Hazard),
            _ => None,
        }
    }

    pub fn is_heuristic(&self) -> bool {
        self.heuristic().is_some()
    }

    /// Symbolic name of the code.
    pub fn code_name(&self) -> &'static str {
        code_name(self.code)
    }
}

impl fmt::Display for XaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (error code={})", self.message, self.code_name())
    }
}

impl std::error::Error for XaError {}

/// Symbolic name of an XA return or error code.
pub fn code_name(code: i32) -> &'static str {
    match code {
        XA_OK => "XA_OK",
        XA_RDONLY => "XA_RDONLY",
        XA_RETRY => "XA_RETRY",
        XA_HEURMIX => "XA_HEURMIX",
        XA_HEURRB => "XA_HEURRB",
        XA_HEURCOM => "XA_HEURCOM",
        XA_HEURHAZ => "XA_HEURHAZ",
        XA_NOMIGRATE => "XA_NOMIGRATE",
        XA_RBROLLBACK => "XA_RBROLLBACK",
        XA_RBCOMMFAIL => "XA_RBCOMMFAIL",
        XA_RBDEADLOCK => "XA_RBDEADLOCK",
        XA_RBINTEGRITY => "XA_RBINTEGRITY",
        XA_RBOTHER => "XA_RBOTHER",
        XA_RBPROTO => "XA_RBPROTO",
        XA_RBTIMEOUT => "XA_RBTIMEOUT",
        XA_RBTRANSIENT => "XA_RBTRANSIENT",
        XAER_ASYNC => "XAER_ASYNC",
        XAER_RMERR => "XAER_RMERR",
        XAER_NOTA => "XAER_NOTA",
        XAER_INVAL => "XAER_INVAL",
        XAER_PROTO => "XAER_PROTO",
        XAER_RMFAIL => "XAER_RMFAIL",
        XAER_DUPID => "XAER_DUPID",
        XAER_OUTSIDE => "XAER_OUTSIDE",
        _ => "!invalid error code!",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_classification() {
        for code in XA_RBBASE..=XA_RBEND {
            assert!(XaError::new(code, "rb").is_rollback());
        }
        assert!(!XaError::rm_fail("down").is_rollback());
        assert!(!XaError::new(XA_HEURRB, "heur").is_rollback());
    }

    #[test]
    fn test_heuristic_classification() {
        assert_eq!(
            XaError::new(XA_HEURCOM, "x").heuristic(),
            Some(HeuristicKind::Commit)
        );
        assert_eq!(
            XaError::new(XA_HEURMIX, "x").heuristic(),
            Some(HeuristicKind::Mixed)
        );
        assert!(XaError::new(XA_HEURHAZ, "x").is_heuristic());
        assert!(!XaError::not_a("x").is_heuristic());
    }

    #[test]
    fn test_display_includes_code_name() {
        let err = XaError::rm_fail("connection reset");
        assert_eq!(
            err.to_string(),
            "connection reset (error code=XAER_RMFAIL)"
        );
        assert_eq!(code_name(42), "!invalid error code!");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<XaError>();
    }
}
