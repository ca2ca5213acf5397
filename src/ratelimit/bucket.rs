//! Token bucket state and the refill-and-consume algorithm.

use std::time::{Duration, Instant};

/// Window reported to clients in `RateLimit-Reset` and `X-Rate-Limit-Duration`.
///
/// Replenishment is continuous; the reporting window is always one second.
pub const RESET_WINDOW: Duration = Duration::from_secs(1);

/// Result of a single consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumption {
    /// Whether a token was taken.
    pub allowed: bool,
    /// Whole tokens left in the bucket after this attempt.
    pub remaining: u64,
    /// Reporting window; always [`RESET_WINDOW`].
    pub reset_after: Duration,
}

/// A continuously replenished token bucket.
///
/// Holds up to `capacity` tokens and gains `rate` tokens per second. Each
/// admitted request takes one token.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: f64, rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last call, then try to take one
    /// token.
    pub fn try_consume(&mut self, now: Instant) -> Consumption {
        self.refill(now);

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        self.check_bounds();

        Consumption {
            allowed,
            remaining: self.tokens.floor() as u64,
            reset_after: RESET_WINDOW,
        }
    }

    /// Adopt a new capacity and rate, keeping accumulated tokens up to the new
    /// capacity.
    pub fn reconfigure(&mut self, capacity: f64, rate: f64) {
        self.capacity = capacity;
        self.rate = rate;
        self.tokens = self.tokens.min(capacity);
    }

    /// Whether this bucket already runs with the given parameters.
    pub fn is_configured(&self, capacity: f64, rate: f64) -> bool {
        self.capacity == capacity && self.rate == rate
    }

    /// Tokens currently available, without refilling.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&mut self, now: Instant) {
        // A reading behind the last refill adds nothing and does not move the
        // refill point backwards.
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = self.last_refill.max(now);
    }

    fn check_bounds(&self) {
        // A count outside the bucket means the per-key serialization was
        // broken somewhere; continuing would silently mis-limit.
        assert!(
            self.tokens >= 0.0 && self.tokens <= self.capacity,
            "token bucket out of bounds: {} tokens, capacity {}",
            self.tokens,
            self.capacity
        );
    }
}
