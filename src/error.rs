//! Error types for the protocol core.
//!
//! One enum covers every failure the gateway can surface to a caller.
//! The HTTP layer maps these onto status codes via [`Sip2Error::http_status`];
//! the connection manager consults [`Sip2Error::counts_as_failure`] when
//! updating a branch's circuit breaker.

use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Sip2Error {
    /// Sequence numbers are a single decimal digit on the wire.
    #[error("sequence number {0} is outside 0-9")]
    InvalidSequence(u8),

    /// The frame does not end with an `AZ<hex4>` trailer.
    #[error("frame trailer is malformed")]
    MalformedTrailer,

    /// The trailer checksum does not match the frame contents.
    #[error("frame checksum mismatch")]
    ChecksumMismatch,

    /// A response frame carried a different command code than the request expects.
    #[error("unexpected response code: expected {expected}, got {got}")]
    UnexpectedResponseCode { expected: &'static str, got: String },

    /// TCP connect or TLS negotiation did not finish within the configured timeout.
    #[error("connection to {host}:{port} timed out")]
    ConnectTimeout { host: String, port: u16 },

    /// The LMS did not answer a request within the configured timeout.
    /// The socket is destroyed so the next call starts from a fresh connection.
    #[error("request timed out after {timeout_ms}ms")]
    RequestTimeout { timeout_ms: u64 },

    /// A pending request already occupies this sequence number.
    #[error("sequence number {0} already has a pending request")]
    SequenceInUse(u8),

    /// All ten sequence numbers have pending requests.
    #[error("client has ten requests outstanding")]
    ClientAtCapacity,

    /// The branch's circuit breaker is open; retry after the carried instant.
    #[error("circuit open for branch")]
    CircuitOpen { retry_at: Instant },

    /// A half-open probe is already in flight for this branch.
    #[error("half-open probe already in flight")]
    ProbeInFlight,

    /// The login handshake was rejected after all attempts.
    #[error("LMS login rejected after {attempts} attempts")]
    LoginRejected { attempts: u32 },

    /// No branch is configured under this id.
    #[error("unknown branch: {0}")]
    UnknownBranch(String),

    /// The process-wide master key is not configured.
    #[error("masking master key is not configured")]
    MasterKeyMissing,

    /// The socket closed or errored while a request was pending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),
}

impl Sip2Error {
    /// HTTP status the out-of-scope routing layer should surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Sip2Error::UnknownBranch(_) => 404,
            Sip2Error::CircuitOpen { .. } | Sip2Error::ProbeInFlight => 503,
            Sip2Error::ConnectTimeout { .. } | Sip2Error::RequestTimeout { .. } => 504,
            _ => 502,
        }
    }

    /// Whether this failure advances the branch's circuit breaker.
    /// Breaker-gated rejections must not feed back into the breaker.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            Sip2Error::CircuitOpen { .. } | Sip2Error::ProbeInFlight | Sip2Error::UnknownBranch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Sip2Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gated_errors_do_not_count() {
        let open = Sip2Error::CircuitOpen { retry_at: Instant::now() };
        assert!(!open.counts_as_failure());
        assert!(!Sip2Error::ProbeInFlight.counts_as_failure());
        assert!(Sip2Error::ChecksumMismatch.counts_as_failure());
        assert!(Sip2Error::RequestTimeout { timeout_ms: 5000 }.counts_as_failure());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(Sip2Error::UnknownBranch("x".into()).http_status(), 404);
        assert_eq!(Sip2Error::ProbeInFlight.http_status(), 503);
        assert_eq!(Sip2Error::RequestTimeout { timeout_ms: 1 }.http_status(), 504);
        assert_eq!(Sip2Error::ChecksumMismatch.http_status(), 502);
        assert_eq!(Sip2Error::LoginRejected { attempts: 3 }.http_status(), 502);
    }
}
