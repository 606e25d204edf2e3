//! Circuit breaker implementation
//!
//! One breaker guards the whole upstream: its counters are shared across
//! every IdP operation, since the upstream is a single failure domain.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Consecutive failures that trip the breaker regardless of rate.
const TRIP_CONSECUTIVE_FAILURES: u32 = 5;
/// Minimum samples in the rolling window before the rate rule applies.
const TRIP_MIN_REQUESTS: u32 = 10;
/// Failure rate above which the breaker trips once enough samples exist.
const TRIP_FAILURE_RATE: f64 = 0.5;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing limited probe requests)
    HalfOpen,
}

impl CircuitState {
    /// Return the lowercase label used in API responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    requests: u32,
    total_failures: u32,
    consecutive_failures: u32,
}

impl Counts {
    fn ready_to_trip(&self) -> bool {
        if self.consecutive_failures >= TRIP_CONSECUTIVE_FAILURES {
            return true;
        }
        self.requests >= TRIP_MIN_REQUESTS
            && f64::from(self.total_failures) / f64::from(self.requests) > TRIP_FAILURE_RATE
    }
}

struct Inner {
    state: CircuitState,
    /// Bumped on every state transition and window roll; samples carrying a
    /// stale generation are discarded.
    generation: u64,
    counts: Counts,
    window_started: Instant,
    opened_at: Instant,
    half_open_in_flight: u32,
}

/// Circuit breaker for upstream protection
pub struct CircuitBreaker {
    name: String,
    interval: Duration,
    timeout: Duration,
    max_requests: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    ///
    /// `interval` is the rolling window over which closed-state counters
    /// accumulate, `timeout` is how long the circuit stays open before
    /// allowing probes, and `max_requests` caps concurrent half-open probes.
    #[must_use]
    pub fn new(name: &str, interval: Duration, timeout: Duration, max_requests: u32) -> Self {
        let now = Instant::now();
        Self {
            name: name.to_string(),
            interval,
            timeout,
            max_requests: max_requests.max(1),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                window_started: now,
                opened_at: now,
                half_open_in_flight: 0,
            }),
        }
    }

    /// Get the current state, applying any due timeout transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.sync_state(&mut inner);
        inner.state
    }

    /// Execute `f` under the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without invoking `f` when the circuit
    /// is open or the half-open probe budget is exhausted; otherwise the
    /// outcome of `f` is recorded and passed through.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// Admit one request, or fail fast.
    pub fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock();
        self.sync_state(&mut inner);

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                warn!(breaker = %self.name, "circuit open, rejecting request");
                return Err(Error::CircuitOpen(self.name.clone()));
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.max_requests {
                    warn!(breaker = %self.name, "half-open probe budget exhausted");
                    return Err(Error::CircuitOpen(self.name.clone()));
                }
                inner.half_open_in_flight += 1;
                debug!(breaker = %self.name, probes = inner.half_open_in_flight, "admitting half-open probe");
            }
        }

        inner.counts.requests += 1;
        Ok(Permit {
            breaker: self,
            generation: inner.generation,
            recorded: false,
        })
    }

    fn record(&self, generation: u64, success: bool) {
        let mut inner = self.inner.lock();
        self.sync_state(&mut inner);
        if inner.generation != generation {
            // The sample belongs to a previous window or state; its
            // counters are gone.
            return;
        }

        match inner.state {
            CircuitState::Closed => {
                if success {
                    inner.counts.consecutive_failures = 0;
                } else {
                    inner.counts.total_failures += 1;
                    inner.counts.consecutive_failures += 1;
                    warn!(
                        breaker = %self.name,
                        consecutive = inner.counts.consecutive_failures,
                        requests = inner.counts.requests,
                        failures = inner.counts.total_failures,
                        "failure in closed state"
                    );
                    if inner.counts.ready_to_trip() {
                        self.transition(&mut inner, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if success {
                    self.transition(&mut inner, CircuitState::Closed);
                } else {
                    warn!(breaker = %self.name, "probe failed, reopening circuit");
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Apply the rolling-window reset (closed) or timeout elapse (open).
    fn sync_state(&self, inner: &mut Inner) {
        match inner.state {
            CircuitState::Closed => {
                if !self.interval.is_zero() && inner.window_started.elapsed() >= self.interval {
                    inner.generation += 1;
                    inner.counts = Counts::default();
                    inner.window_started = Instant::now();
                }
            }
            CircuitState::Open => {
                if inner.opened_at.elapsed() >= self.timeout {
                    debug!(breaker = %self.name, "open timeout elapsed, transitioning to half-open");
                    self.transition(inner, CircuitState::HalfOpen);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, new_state: CircuitState) {
        if inner.state == new_state {
            return;
        }
        inner.state = new_state;
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.half_open_in_flight = 0;

        match new_state {
            CircuitState::Closed => {
                inner.window_started = Instant::now();
                info!(breaker = %self.name, "circuit breaker closed");
            }
            CircuitState::Open => {
                inner.opened_at = Instant::now();
                warn!(breaker = %self.name, "circuit breaker opened");
            }
            CircuitState::HalfOpen => {
                debug!(breaker = %self.name, "circuit breaker half-open");
            }
        }
    }
}

/// Admission token returned by [`CircuitBreaker::acquire`].
///
/// Every permit must be resolved with [`success`](Permit::success) or
/// [`failure`](Permit::failure); a permit dropped mid-flight (cancelled
/// request) is recorded as a failure so a half-open probe slot cannot leak.
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    recorded: bool,
}

impl Permit<'_> {
    /// Record a successful request
    pub fn success(mut self) {
        self.recorded = true;
        self.breaker.record(self.generation, true);
    }

    /// Record a failed request
    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.record(self.generation, false);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.breaker.record(self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(interval: Duration, timeout: Duration, max_requests: u32) -> CircuitBreaker {
        CircuitBreaker::new("test", interval, timeout, max_requests)
    }

    fn fail_once(cb: &CircuitBreaker) {
        cb.acquire().expect("breaker should admit").failure();
    }

    fn succeed_once(cb: &CircuitBreaker) {
        cb.acquire().expect("breaker should admit").success();
    }

    #[test]
    fn starts_closed_and_allows_requests() {
        let cb = breaker(Duration::from_secs(60), Duration::from_secs(30), 5);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.acquire().is_ok());
    }

    #[test]
    fn opens_after_five_consecutive_failures() {
        let cb = breaker(Duration::from_secs(60), Duration::from_secs(30), 5);
        for _ in 0..4 {
            fail_once(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.acquire(), Err(Error::CircuitOpen(_))));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = breaker(Duration::from_secs(60), Duration::from_secs(30), 5);
        for _ in 0..4 {
            fail_once(&cb);
        }
        succeed_once(&cb);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn opens_on_failure_rate_once_enough_samples() {
        let cb = breaker(Duration::from_secs(60), Duration::from_secs(30), 5);
        // F F S repeating: consecutive never reaches 5, but at the 10th
        // sample the window holds 7 failures out of 10 requests.
        let pattern = [false, false, true, false, false, true, false, false, true, false];
        for ok in pattern {
            if ok {
                succeed_once(&cb);
            } else {
                fail_once(&cb);
            }
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn window_roll_clears_counters() {
        let cb = breaker(Duration::from_millis(10), Duration::from_secs(30), 5);
        for _ in 0..4 {
            fail_once(&cb);
        }
        std::thread::sleep(Duration::from_millis(15));
        // The window rolled, so this is the first failure of a new window.
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn open_transitions_to_half_open_after_timeout() {
        let cb = breaker(Duration::from_secs(60), Duration::from_millis(10), 5);
        for _ in 0..5 {
            fail_once(&cb);
        }
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.acquire().is_ok());
    }

    #[test]
    fn half_open_caps_concurrent_probes() {
        let cb = breaker(Duration::from_secs(60), Duration::from_millis(10), 2);
        for _ in 0..5 {
            fail_once(&cb);
        }
        std::thread::sleep(Duration::from_millis(15));

        let first = cb.acquire().expect("first probe");
        let second = cb.acquire().expect("second probe");
        assert!(
            matches!(cb.acquire(), Err(Error::CircuitOpen(_))),
            "third concurrent probe must be rejected"
        );
        // A successful probe closes the breaker.
        first.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        drop(second);
    }

    #[test]
    fn failed_probe_reopens_circuit() {
        let cb = breaker(Duration::from_secs(60), Duration::from_millis(10), 5);
        for _ in 0..5 {
            fail_once(&cb);
        }
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        fail_once(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn dropped_permit_counts_as_failure() {
        let cb = breaker(Duration::from_secs(60), Duration::from_secs(30), 5);
        for _ in 0..5 {
            let permit = cb.acquire().expect("admit");
            drop(permit);
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn call_records_outcome() {
        let cb = breaker(Duration::from_secs(60), Duration::from_secs(30), 5);
        for _ in 0..5 {
            let res: Result<()> = cb.call(|| async { Err(Error::Transport("down".into())) }).await;
            assert!(res.is_err());
        }
        let res: Result<()> = cb.call(|| async { Ok(()) }).await;
        assert!(
            matches!(res, Err(Error::CircuitOpen(_))),
            "sixth call must fail fast without running the closure"
        );
    }

    #[test]
    fn state_labels() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
    }
}
