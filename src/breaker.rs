//! Per-branch circuit breaker.
//!
//! CLOSED passes traffic, OPEN fails fast until the backoff expires,
//! HALF_OPEN admits exactly one probe. The OPEN -> HALF_OPEN transition
//! is evaluated lazily when the manager next gates a call; no timer task
//! runs in the background. Repeated failures walk a fixed backoff
//! schedule and park on its last slot.

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

/// Consecutive failures before the circuit opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Default wait schedule between OPEN transitions, indexed per transition.
pub const DEFAULT_BACKOFF: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(40),
    Duration::from_secs(60),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operation, requests allowed.
    Closed,
    /// Failing, requests blocked until `retry_at`.
    Open,
    /// Testing recovery with a single probe.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    retry_at: Option<Instant>,
    backoff_index: usize,
    probe_in_flight: bool,
    threshold: u32,
    schedule: Vec<Duration>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::with_profile(DEFAULT_FAILURE_THRESHOLD, DEFAULT_BACKOFF.to_vec())
    }

    /// Custom threshold and backoff schedule (test profiles use short
    /// millisecond schedules). The schedule must be non-empty.
    pub fn with_profile(threshold: u32, schedule: Vec<Duration>) -> Self {
        debug_assert!(!schedule.is_empty());
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            retry_at: None,
            backoff_index: 0,
            probe_in_flight: false,
            threshold,
            schedule,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// When an OPEN circuit will next admit a probe.
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn probe_in_flight(&self) -> bool {
        self.probe_in_flight
    }

    /// Take the single HALF_OPEN probe slot.
    pub fn begin_probe(&mut self) {
        self.probe_in_flight = true;
    }

    /// Lazily move OPEN to HALF_OPEN once the backoff has expired.
    pub fn refresh(&mut self) {
        if self.state == CircuitState::Open {
            if let Some(retry_at) = self.retry_at {
                if Instant::now() >= retry_at {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = false;
                    info!("circuit half-open, admitting probe");
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!("circuit closed after successful call");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.backoff_index = 0;
        self.retry_at = None;
        self.probe_in_flight = false;
    }

    /// Record a protocol failure. Returns `true` when this failure opened
    /// (or re-opened) the circuit, so the caller can drop its cached client.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.probe_in_flight = false;
        self.last_failure = Some(Instant::now());

        let should_open =
            self.state == CircuitState::HalfOpen || self.consecutive_failures >= self.threshold;
        if !should_open {
            warn!(failures = self.consecutive_failures, "branch call failed");
            return false;
        }

        let wait = self.schedule[self.backoff_index.min(self.schedule.len() - 1)];
        self.retry_at = Some(Instant::now() + wait);
        self.backoff_index = (self.backoff_index + 1).min(self.schedule.len() - 1);
        if self.state != CircuitState::Open {
            error!(
                failures = self.consecutive_failures,
                backoff_ms = wait.as_millis() as u64,
                "circuit opened"
            );
        }
        self.state = CircuitState::Open;
        true
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> CircuitBreaker {
        CircuitBreaker::with_profile(
            3,
            vec![Duration::from_millis(20), Duration::from_millis(40), Duration::from_millis(80)],
        )
    }

    #[test]
    fn test_starts_closed() {
        let b = CircuitBreaker::new();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
        assert!(!b.probe_in_flight());
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut b = fast();
        assert!(!b.record_failure());
        assert!(!b.record_failure());
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.record_failure());
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.retry_at().is_some());
    }

    #[test]
    fn test_closed_failure_count_stays_below_threshold() {
        let mut b = fast();
        b.record_failure();
        b.record_failure();
        assert!(b.failure_count() < 3);
        b.record_failure();
        // count keeps growing once open; the invariant binds CLOSED only
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_after_backoff() {
        let mut b = fast();
        for _ in 0..3 {
            b.record_failure();
        }
        b.refresh();
        assert_eq!(b.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(25));
        b.refresh();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(!b.probe_in_flight());
    }

    #[test]
    fn test_success_under_half_open_closes_and_resets() {
        let mut b = fast();
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        b.refresh();
        b.begin_probe();
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
        assert!(!b.probe_in_flight());
        assert!(b.retry_at().is_none());
        // backoff index reset: next opening uses the first slot again
        for _ in 0..3 {
            b.record_failure();
        }
        let wait = b.retry_at().unwrap() - Instant::now();
        assert!(wait <= Duration::from_millis(20));
    }

    #[test]
    fn test_failure_under_half_open_reopens_and_advances_backoff() {
        let mut b = fast();
        for _ in 0..3 {
            b.record_failure();
        }
        let first_wait = b.retry_at().unwrap() - Instant::now();
        std::thread::sleep(Duration::from_millis(25));
        b.refresh();
        b.begin_probe();
        assert!(b.record_failure());
        assert_eq!(b.state(), CircuitState::Open);
        let second_wait = b.retry_at().unwrap() - Instant::now();
        assert!(second_wait > first_wait);
    }

    #[test]
    fn test_backoff_caps_at_last_slot() {
        let mut b = fast();
        // open repeatedly; index must park on the last slot
        for _ in 0..10 {
            for _ in 0..3 {
                b.record_failure();
            }
        }
        let wait = b.retry_at().unwrap() - Instant::now();
        assert!(wait <= Duration::from_millis(80));
        assert!(wait > Duration::from_millis(40));
    }

    #[test]
    fn test_probe_slot_is_exclusive() {
        let mut b = fast();
        for _ in 0..3 {
            b.record_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        b.refresh();
        assert!(!b.probe_in_flight());
        b.begin_probe();
        assert!(b.probe_in_flight());
    }
}
