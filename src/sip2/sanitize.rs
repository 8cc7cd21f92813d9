//! Field sanitization for outbound frames.
//!
//! SIP2 reserves `|` as the field delimiter and `\r` as the frame
//! terminator; control bytes have no place in field values at all.
//! Untrusted values pass through [`sanitize`] before they enter a frame,
//! and the whole frame passes through [`to_ascii`] at the socket write
//! boundary since the wire encoding is strictly 7-bit ASCII.

use deunicode::deunicode;

/// Strip protocol-reserved bytes from an untrusted value.
///
/// Removes `|`, `\r`, `\n` and every code point below 0x20. Everything
/// else, including non-ASCII, is preserved; transliteration happens later
/// at the write boundary.
pub fn sanitize(input: &str) -> String {
    input
        .chars()
        .filter(|&c| c != '|' && c >= '\u{20}')
        .collect()
}

/// Transliterate remaining non-ASCII characters to their closest ASCII
/// equivalents. Applied to the complete frame immediately before it is
/// written to the socket.
pub fn to_ascii(frame: &str) -> String {
    if frame.is_ascii() {
        return frame.to_string();
    }
    deunicode(frame)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// sanitization is idempotent
        #[test]
        fn sanitize_idempotent(s in ".*") {
            let once = sanitize(&s);
            prop_assert_eq!(sanitize(&once), once);
        }

        /// sanitized output never contains reserved bytes
        #[test]
        fn sanitize_excludes_reserved(s in ".*") {
            let out = sanitize(&s);
            prop_assert!(!out.contains('|'));
            prop_assert!(!out.contains('\r'));
            prop_assert!(!out.contains('\n'));
            prop_assert!(out.chars().all(|c| c >= '\u{20}'), "sanitized output contains control characters");
        }

        /// transliteration always yields pure ASCII
        #[test]
        fn to_ascii_is_ascii(s in ".*") {
            prop_assert!(to_ascii(&s).is_ascii());
        }
    }
}
