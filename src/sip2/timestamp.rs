//! SIP2 transaction timestamps.
//!
//! The protocol's timestamp layout is `YYYYMMDD` + four spaces + `HHMMSS`,
//! 18 bytes, always UTC. Response timestamps are treated as opaque strings
//! and never parsed back; clock skew against the LMS must not matter.

use chrono::{DateTime, Utc};

/// Length in bytes of a SIP2 timestamp field.
pub const TIMESTAMP_LEN: usize = 18;

/// Render an instant in the SIP2 wire layout.
pub fn sip_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d    %H%M%S").to_string()
}

/// The current time in the SIP2 wire layout.
pub fn now() -> String {
    sip_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 59).unwrap();
        let ts = sip_timestamp(at);
        assert_eq!(ts, "20240309    140559");
        assert_eq!(ts.len(), TIMESTAMP_LEN);
    }

    #[test]
    fn test_zero_padding() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(sip_timestamp(at), "20240101    000000");
    }

    #[test]
    fn test_now_is_well_formed() {
        let ts = now();
        assert_eq!(ts.len(), TIMESTAMP_LEN);
        assert_eq!(&ts[8..12], "    ");
        assert!(ts[..8].bytes().all(|b| b.is_ascii_digit()));
        assert!(ts[12..].bytes().all(|b| b.is_ascii_digit()));
    }
}
