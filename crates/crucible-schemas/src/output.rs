//! Output truncation.
//!
//! Combined stdout+stderr is capped before it ever reaches an event or the
//! durable store. The cap is byte-based but never splits a UTF-8 character,
//! so the stored prefix can be slightly shorter than the cap for multi-byte
//! input. `size` always reports the pre-truncation byte count.

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TruncatedOutput {
    pub output: String,
    pub truncated: bool,
    /// Original size in bytes, before any truncation.
    pub size: u64,
}

/// Cap `raw` at `limit_bytes`.
///
/// Exactly-at-the-limit input passes through untruncated.
pub fn truncate_output(raw: &str, limit_bytes: usize) -> TruncatedOutput {
    let size = raw.len() as u64;
    if raw.len() <= limit_bytes {
        return TruncatedOutput {
            output: raw.to_string(),
            truncated: false,
            size,
        };
    }

    let mut cut = limit_bytes;
    while cut > 0 && !raw.is_char_boundary(cut) {
        cut -= 1;
    }

    TruncatedOutput {
        output: raw[..cut].to_string(),
        truncated: true,
        size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1_048_576;

    #[test]
    fn exactly_one_mib_is_not_truncated() {
        let raw = "x".repeat(MIB);
        let t = truncate_output(&raw, MIB);
        assert!(!t.truncated);
        assert_eq!(t.size, MIB as u64);
        assert_eq!(t.output.len(), MIB);
    }

    #[test]
    fn one_mib_plus_one_is_truncated_to_one_mib() {
        let raw = "x".repeat(MIB + 1);
        let t = truncate_output(&raw, MIB);
        assert!(t.truncated);
        assert_eq!(t.size, (MIB + 1) as u64);
        assert_eq!(t.output.len(), MIB);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; a cap landing mid-char backs off one byte.
        let raw = "é".repeat(5); // 10 bytes
        let t = truncate_output(&raw, 5);
        assert!(t.truncated);
        assert_eq!(t.output.len(), 4);
        assert_eq!(t.size, 10);
    }

    #[test]
    fn empty_output_is_passed_through() {
        let t = truncate_output("", MIB);
        assert!(!t.truncated);
        assert_eq!(t.size, 0);
        assert_eq!(t.output, "");
    }
}
