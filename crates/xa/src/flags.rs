//! XA flags (from the X/Open XA specification)

/// No flags set.
pub const TMNOFLAGS: i32 = 0x0000_0000;

/// Caller is joining existing transaction branch.
pub const TMJOIN: i32 = 0x0020_0000;

/// Caller is resuming association with suspended transaction branch.
pub const TMRESUME: i32 = 0x0800_0000;

/// Dissociate caller from transaction branch - successful.
pub const TMSUCCESS: i32 = 0x0400_0000;

/// Dissociate caller from transaction branch - failed.
pub const TMFAIL: i32 = 0x2000_0000;

/// Caller is suspending (not ending) its association with transaction branch.
pub const TMSUSPEND: i32 = 0x0200_0000;

/// Start a recovery scan.
pub const TMSTARTRSCAN: i32 = 0x0100_0000;

/// End a recovery scan.
pub const TMENDRSCAN: i32 = 0x0080_0000;

/// Use one-phase commit optimization.
pub const TMONEPHASE: i32 = 0x4000_0000;

/// Human readable form of a flag value, for logs.
pub fn decode_flags(flags: i32) -> String {
    const NAMES: [(i32, &str); 8] = [
        (TMJOIN, "JOIN"),
        (TMRESUME, "RESUME"),
        (TMSUCCESS, "SUCCESS"),
        (TMFAIL, "FAIL"),
        (TMSUSPEND, "SUSPEND"),
        (TMSTARTRSCAN, "STARTRSCAN"),
        (TMENDRSCAN, "ENDRSCAN"),
        (TMONEPHASE, "ONEPHASE"),
    ];

    if flags == TMNOFLAGS {
        return "NOFLAGS".to_string();
    }

    let names: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        format!("{:#x}", flags)
    } else {
        names.join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_flags() {
        assert_eq!(decode_flags(TMNOFLAGS), "NOFLAGS");
        assert_eq!(decode_flags(TMSUCCESS), "SUCCESS");
        assert_eq!(decode_flags(TMSTARTRSCAN | TMENDRSCAN), "STARTRSCAN|ENDRSCAN");
        assert_eq!(decode_flags(0x1), "0x1");
    }
}
