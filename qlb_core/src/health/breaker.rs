//! Circuit Breaker (spec §4.E): one mutex per breaker, O(1) critical
//! sections, per spec §5's concurrency policy.
//!
//! Grounded on the teacher's `selenia_core::ratelimit` token bucket: same
//! shape (a small `Mutex`-guarded state struct with a handful of `f64`/u32
//! counters, mutated under one short-held lock per call).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    requests: u64,
    consecutive_success: u32,
    last_fail: Option<Instant>,
    last_open: Option<Instant>,
}

/// Per-backend three-state gate. Parameters `threshold`/`open_timeout` are
/// fixed at construction (spec §3 "Breaker" invariant).
pub struct Breaker {
    inner: Mutex<Inner>,
    threshold: u32,
    open_timeout: Duration,
}

const HALF_OPEN_SUCCESSES_TO_CLOSE: u32 = 3;

impl Breaker {
    pub fn new() -> Self {
        Self::with_params(5, Duration::from_secs(30))
    }

    pub fn with_params(threshold: u32, open_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                requests: 0,
                consecutive_success: 0,
                last_fail: None,
                last_open: None,
            }),
            threshold,
            open_timeout,
        }
    }

    /// Current externally-visible state, resolving the `open -> half-open`
    /// transition lazily on read (spec: "requires now - last_open >=
    /// open_timeout, next admitted request").
    pub fn state(&self, now: Instant) -> BreakerState {
        let mut guard = self.inner.lock().unwrap();
        self.maybe_half_open(&mut guard, now);
        guard.state
    }

    fn maybe_half_open(&self, guard: &mut Inner, now: Instant) {
        if guard.state == BreakerState::Open {
            if let Some(last_open) = guard.last_open {
                if now.saturating_duration_since(last_open) >= self.open_timeout {
                    guard.state = BreakerState::HalfOpen;
                    guard.consecutive_success = 0;
                }
            }
        }
    }

    /// Admission check for an incoming request. `open` => reject fast.
    /// `half_open` => admit exactly the trial request (this call itself
    /// counts as the trial; callers should not call `admit` twice for one
    /// request).
    pub fn admit(&self, now: Instant) -> bool {
        let mut guard = self.inner.lock().unwrap();
        self.maybe_half_open(&mut guard, now);
        !matches!(guard.state, BreakerState::Open)
    }

    pub fn on_request_start(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.requests += 1;
    }

    pub fn on_success(&self, now: Instant) {
        let mut guard = self.inner.lock().unwrap();
        self.maybe_half_open(&mut guard, now);
        match guard.state {
            BreakerState::HalfOpen => {
                guard.consecutive_success += 1;
                if guard.consecutive_success >= HALF_OPEN_SUCCESSES_TO_CLOSE {
                    guard.state = BreakerState::Closed;
                    guard.failures = 0;
                    guard.consecutive_success = 0;
                }
            }
            BreakerState::Closed => {
                guard.failures = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self, now: Instant) {
        let mut guard = self.inner.lock().unwrap();
        self.maybe_half_open(&mut guard, now);
        guard.last_fail = Some(now);
        match guard.state {
            BreakerState::HalfOpen => {
                guard.state = BreakerState::Open;
                guard.last_open = Some(now);
                guard.consecutive_success = 0;
                warn!("breaker reopened after half-open trial failure");
            }
            BreakerState::Closed => {
                guard.failures += 1;
                if guard.failures >= self.threshold {
                    guard.state = BreakerState::Open;
                    guard.last_open = Some(now);
                    warn!(failures = guard.failures, "breaker tripped open");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn weight(&self, now: Instant) -> f64 {
        match self.state(now) {
            BreakerState::Closed => 1.0,
            BreakerState::HalfOpen => 0.5,
            BreakerState::Open => 0.0,
        }
    }
}

impl Default for Breaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Scenario 5 from spec §8: trip at threshold, recover after open_timeout
    // plus three consecutive half-open successes.
    #[test]
    fn trip_and_recover() {
        let breaker = Breaker::with_params(5, Duration::from_millis(30));
        let t0 = Instant::now();
        for _ in 0..4 {
            breaker.on_failure(t0);
        }
        assert_eq!(breaker.state(t0), BreakerState::Closed);
        breaker.on_failure(t0);
        assert_eq!(breaker.state(t0), BreakerState::Open);
        assert!(!breaker.admit(t0));

        let t1 = t0 + Duration::from_millis(31);
        assert!(breaker.admit(t1));
        assert_eq!(breaker.state(t1), BreakerState::HalfOpen);

        breaker.on_success(t1);
        breaker.on_success(t1);
        assert_eq!(breaker.state(t1), BreakerState::HalfOpen);
        breaker.on_success(t1);
        assert_eq!(breaker.state(t1), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = Breaker::with_params(1, Duration::from_millis(10));
        let t0 = Instant::now();
        breaker.on_failure(t0);
        assert_eq!(breaker.state(t0), BreakerState::Open);
        let t1 = t0 + Duration::from_millis(11);
        assert_eq!(breaker.state(t1), BreakerState::HalfOpen);
        breaker.on_failure(t1);
        assert_eq!(breaker.state(t1), BreakerState::Open);
    }
}
