//! Session id encoding.
//!
//! Session ids travel on the wire as short hex strings (`"000a"`) but the
//! worker keys its session map by their numeric form, so both directions are
//! provided here.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next session id for this process.
pub fn next_session_id() -> String {
    encode_session_id(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Formats a numeric session id as its wire form.
pub fn encode_session_id(id: u64) -> String {
    format!("{id:04x}")
}

/// Parses the wire form back into its numeric value.
pub fn decode_session_id(id: &str) -> Option<u64> {
    u64::from_str_radix(id, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        assert_eq!(encode_session_id(10), "000a");
        assert_eq!(decode_session_id("000a"), Some(10));
        assert_eq!(decode_session_id("ff"), Some(255));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_session_id("xyz"), None);
        assert_eq!(decode_session_id(""), None);
    }

    #[test]
    fn test_next_is_monotonic() {
        let a = next_session_id();
        let b = next_session_id();
        assert_ne!(a, b);
    }
}
