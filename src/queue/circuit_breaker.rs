//! Per-module circuit breakers.
//!
//! A breaker opens after `failure_threshold` consecutive failures, stays open
//! for `timeout`, then lets a single trial through in half-open state. The
//! trial's outcome closes or re-opens the circuit.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are refused until the timeout elapses
    Open,
    /// One trial request is allowed through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures since the last success
    pub failure_count: u32,
    /// Successes since the last reset
    pub success_count: u32,
    /// Time since the last recorded failure
    pub since_last_failure: Option<Duration>,
}

/// Failure isolation state machine for one module.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    timeout: Duration,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub const fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            trial_in_flight: false,
        }
    }

    /// Current state without side effects.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a request may be dispatched now.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open here.
    /// In half-open only one trial is admitted until its outcome is recorded.
    pub fn can_execute(&mut self, now: Instant) -> bool {
        if self.state == CircuitState::Open {
            let elapsed = self
                .last_failure_time
                .map_or(self.timeout, |t| now.saturating_duration_since(t));
            if elapsed < self.timeout {
                return false;
            }
            self.state = CircuitState::HalfOpen;
            self.trial_in_flight = false;
        }

        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                true
            },
            CircuitState::HalfOpen | CircuitState::Open => false,
        }
    }

    /// Whether [`can_execute`](Self::can_execute) would admit a request,
    /// without claiming the trial slot.
    #[must_use]
    pub fn would_admit(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trial_in_flight,
            CircuitState::Open => self
                .last_failure_time
                .map_or(self.timeout, |t| now.saturating_duration_since(t))
                >= self.timeout,
        }
    }

    /// Give back a half-open trial that was admitted but never dispatched.
    pub fn cancel_trial(&mut self) {
        self.trial_in_flight = false;
    }

    /// Record a successful execution.
    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.success_count = 0;
                self.trial_in_flight = false;
            },
            CircuitState::Closed | CircuitState::Open => {
                self.failure_count = 0;
                self.success_count = self.success_count.saturating_add(1);
            },
        }
    }

    /// Record a failed execution.
    pub fn record_failure(&mut self, now: Instant) {
        self.last_failure_time = Some(now);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.failure_count = 0;
                self.success_count = 0;
                self.trial_in_flight = false;
            },
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open;
                }
            },
            CircuitState::Open => {},
        }
    }

    /// Open the circuit regardless of counters.
    pub fn force_open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_failure_time = Some(now);
        self.trial_in_flight = false;
    }

    /// Return to closed with cleared counters.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure_time = None;
        self.trial_in_flight = false;
    }

    /// Snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            since_last_failure: self
                .last_failure_time
                .map(|t| now.saturating_duration_since(t)),
        }
    }
}

/// Breakers keyed by module, created on first use.
#[derive(Debug)]
pub struct CircuitBreakers {
    failure_threshold: u32,
    timeout: Duration,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakers {
    /// Create an empty registry; new breakers share the given settings.
    #[must_use]
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<T>(&self, module: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let breaker = breakers
            .entry(module.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.failure_threshold, self.timeout));
        f(breaker)
    }

    /// See [`CircuitBreaker::can_execute`].
    pub fn can_execute(&self, module: &str) -> bool {
        self.with_breaker(module, |b| b.can_execute(Instant::now()))
    }

    /// See [`CircuitBreaker::would_admit`]. Unknown modules are admitted.
    #[must_use]
    pub fn would_admit(&self, module: &str) -> bool {
        let now = Instant::now();
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(module)
            .map_or(true, |b| b.would_admit(now))
    }

    /// See [`CircuitBreaker::cancel_trial`].
    pub fn cancel_trial(&self, module: &str) {
        self.with_breaker(module, CircuitBreaker::cancel_trial);
    }

    /// Record a success for `module`.
    pub fn record_success(&self, module: &str) {
        let (before, after) = self.with_breaker(module, |b| {
            let before = b.state();
            b.record_success();
            (before, b.state())
        });
        if before != after {
            info!(module, from = %before, to = %after, "Circuit breaker closed");
        }
    }

    /// Record a failure for `module`.
    pub fn record_failure(&self, module: &str) {
        let (before, after) = self.with_breaker(module, |b| {
            let before = b.state();
            b.record_failure(Instant::now());
            (before, b.state())
        });
        if before != after {
            warn!(module, from = %before, to = %after, "Circuit breaker opened");
        }
    }

    /// Force the breaker for `module` open.
    pub fn force_open(&self, module: &str) {
        self.with_breaker(module, |b| b.force_open(Instant::now()));
        warn!(module, "Circuit breaker forced open");
    }

    /// Reset the breaker for `module` to closed.
    pub fn reset(&self, module: &str) {
        self.with_breaker(module, CircuitBreaker::reset);
        info!(module, "Circuit breaker reset");
    }

    /// Current state of `module`'s breaker; unknown modules are closed.
    #[must_use]
    pub fn state(&self, module: &str) -> CircuitState {
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(module)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }

    /// Snapshots of every known breaker.
    #[must_use]
    pub fn snapshots(&self) -> HashMap<String, CircuitSnapshot> {
        let now = Instant::now();
        self.breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(module, b)| (module.clone(), b.snapshot(now)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[test]
    fn test_opens_after_threshold() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(2, TIMEOUT);

        breaker.record_failure(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute(now));

        breaker.record_failure(now);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(2, TIMEOUT);

        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot(now).failure_count, 1);
    }

    #[test]
    fn test_half_open_admits_single_trial() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(1, TIMEOUT);
        breaker.record_failure(now);

        let later = now + TIMEOUT;
        assert!(breaker.can_execute(later));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.can_execute(later));
    }

    #[test]
    fn test_half_open_success_closes() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(1, TIMEOUT);
        breaker.record_failure(now);
        assert!(breaker.can_execute(now + TIMEOUT));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute(now + TIMEOUT));
    }

    #[test]
    fn test_half_open_failure_reopens_with_new_timeout() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(1, TIMEOUT);
        breaker.record_failure(now);

        let trial_at = now + TIMEOUT;
        assert!(breaker.can_execute(trial_at));
        breaker.record_failure(trial_at);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute(trial_at + Duration::from_secs(10)));
        assert!(breaker.can_execute(trial_at + TIMEOUT));
    }

    #[test]
    fn test_cancelled_trial_can_be_retaken() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(1, TIMEOUT);
        breaker.record_failure(now);

        assert!(breaker.can_execute(now + TIMEOUT));
        breaker.cancel_trial();
        assert!(breaker.can_execute(now + TIMEOUT));
    }

    #[test]
    fn test_would_admit_leaves_trial_unclaimed() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(1, TIMEOUT);
        breaker.record_failure(now);

        assert!(!breaker.would_admit(now));
        assert!(breaker.would_admit(now + TIMEOUT));
        assert!(breaker.would_admit(now + TIMEOUT));
        assert!(breaker.can_execute(now + TIMEOUT));
        assert!(!breaker.would_admit(now + TIMEOUT));
    }

    #[test]
    fn test_force_open_and_reset() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(5, TIMEOUT);

        breaker.force_open(now);
        assert!(!breaker.can_execute(now));

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute(now));
    }

    #[test]
    fn test_registry_isolates_modules() {
        let breakers = CircuitBreakers::new(2, TIMEOUT);
        breakers.record_failure("sync");
        breakers.record_failure("sync");

        assert_eq!(breakers.state("sync"), CircuitState::Open);
        assert!(!breakers.can_execute("sync"));
        assert!(breakers.can_execute("lyrics"));
        assert_eq!(breakers.state("unknown"), CircuitState::Closed);

        breakers.reset("sync");
        assert!(breakers.can_execute("sync"));
        assert_eq!(breakers.snapshots().len(), 2);
    }
}
