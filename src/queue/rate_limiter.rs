//! Per-module rate limiting.
//!
//! Token bucket: `capacity` tokens refill continuously at `rate` tokens per
//! second. Acquisition never blocks; callers back off and retry.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

/// Token bucket for one module.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    rate: f64,
    available_tokens: f64,
    last_refill: Instant,
    // Grants inside the trailing one-second window. Tokens bound the burst,
    // this log bounds any single second to `capacity` grants.
    recent: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a full bucket admitting `ops_per_sec` operations per second.
    #[must_use]
    pub fn new(ops_per_sec: u32, now: Instant) -> Self {
        let limit = f64::from(ops_per_sec.max(1));
        Self {
            capacity: limit,
            rate: limit,
            available_tokens: limit,
            last_refill: now,
            recent: VecDeque::new(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn window_full(&self) -> bool {
        self.recent.len() as f64 >= self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.available_tokens = elapsed.mul_add(self.rate, self.available_tokens).min(self.capacity);
        self.last_refill = now;

        while let Some(front) = self.recent.front() {
            if now.saturating_duration_since(*front) >= WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.has_capacity(now) {
            self.available_tokens -= 1.0;
            self.recent.push_back(now);
            true
        } else {
            false
        }
    }

    /// Whether [`try_acquire`](Self::try_acquire) would grant a token now.
    pub fn has_capacity(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.available_tokens >= 1.0 && !self.window_full()
    }

    /// Tokens currently available (after refill).
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.available_tokens
    }
}

/// Rate limiters keyed by module, created on first use.
#[derive(Debug)]
pub struct RateLimiters {
    ops_per_sec: u32,
    limiters: Mutex<HashMap<String, RateLimiter>>,
}

impl RateLimiters {
    /// Create an empty registry; new buckets admit `ops_per_sec`.
    #[must_use]
    pub fn new(ops_per_sec: u32) -> Self {
        Self {
            ops_per_sec,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `module` could take a token now. Unknown modules can.
    pub fn has_capacity(&self, module: &str) -> bool {
        let now = Instant::now();
        self.limiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get_mut(module)
            .map_or(true, |limiter| limiter.has_capacity(now))
    }

    /// Take a token for `module` if one is available.
    pub fn try_acquire(&self, module: &str) -> bool {
        let now = Instant::now();
        let mut limiters = self
            .limiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        limiters
            .entry(module.to_string())
            .or_insert_with(|| RateLimiter::new(self.ops_per_sec, now))
            .try_acquire(now)
    }
}
