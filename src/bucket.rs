//! Token bucket with lazy, clock-driven refill.
//!
//! There is no background task: every read first tops up the bucket by the time elapsed
//! since the last refill. A withdrawal that does not fit leaves the bucket untouched.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::TokenBucketPolicy;

const SECS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_hour: f64,
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(capacity: f64, refill_per_hour: f64, now: DateTime<Utc>) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            refill_per_hour: refill_per_hour.max(0.0),
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn from_policy(p: &TokenBucketPolicy, now: DateTime<Utc>) -> Self {
        Self::new(p.capacity, p.refill_rate_per_hour, now)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_per_hour(&self) -> f64 {
        self.refill_per_hour
    }

    fn refilled(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.last_refill).num_milliseconds();
        if elapsed <= 0 {
            return self.tokens;
        }
        let hours = elapsed as f64 / 1000.0 / SECS_PER_HOUR;
        (self.tokens + hours * self.refill_per_hour).min(self.capacity)
    }

    /// Tokens available at `now`, without withdrawing.
    pub fn available(&self, now: DateTime<Utc>) -> f64 {
        self.refilled(now)
    }

    /// Withdraw `n` tokens if available. On `false` the bucket is unchanged.
    pub fn try_withdraw(&mut self, n: f64, now: DateTime<Utc>) -> bool {
        let tokens = self.refilled(now);
        if tokens + 1e-9 < n {
            return false;
        }
        self.tokens = (tokens - n).max(0.0);
        if now > self.last_refill {
            self.last_refill = now;
        }
        true
    }

    /// Adopt new limits. Current tokens are clamped to the new capacity.
    pub fn reconfigure(&mut self, p: &TokenBucketPolicy, now: DateTime<Utc>) {
        if p.capacity == self.capacity && p.refill_rate_per_hour == self.refill_per_hour {
            return;
        }
        self.tokens = self.refilled(now);
        if now > self.last_refill {
            self.last_refill = now;
        }
        self.capacity = p.capacity.max(0.0);
        self.refill_per_hour = p.refill_rate_per_hour.max(0.0);
        self.tokens = self.tokens.min(self.capacity);
    }
}
