//! Hourly spend budget for advisory calls.
//!
//! Spend is tracked per wall-clock hour (windows aligned to the top of the hour). An
//! estimated cost is charged when a call is attempted, whatever its outcome; if the
//! advisor later reports the actual cost, the difference is settled in the same window.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpendBudget {
    max_per_hour: f64,
    window_start: Option<DateTime<Utc>>,
    spent: f64,
}

impl SpendBudget {
    pub fn new(max_per_hour: f64) -> Self {
        Self {
            max_per_hour,
            window_start: None,
            spent: 0.0,
        }
    }

    pub fn max_per_hour(&self) -> f64 {
        self.max_per_hour
    }

    pub fn set_max_per_hour(&mut self, max: f64) {
        self.max_per_hour = max;
    }

    fn hour_of(now: DateTime<Utc>) -> DateTime<Utc> {
        now.duration_trunc(Duration::hours(1)).unwrap_or(now)
    }

    fn spent_at(&self, now: DateTime<Utc>) -> f64 {
        match self.window_start {
            Some(start) if start == Self::hour_of(now) => self.spent,
            _ => 0.0,
        }
    }

    /// Remaining budget in the hour containing `now`.
    pub fn remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.max_per_hour - self.spent_at(now)).max(0.0)
    }

    /// Whether `cost` fits in the remaining budget. Does not charge.
    pub fn can_afford(&self, cost: f64, now: DateTime<Utc>) -> bool {
        self.spent_at(now) + cost <= self.max_per_hour
    }

    pub fn charge(&mut self, cost: f64, now: DateTime<Utc>) {
        let hour = Self::hour_of(now);
        if self.window_start != Some(hour) {
            self.window_start = Some(hour);
            self.spent = 0.0;
        }
        self.spent = (self.spent + cost).max(0.0);
    }

    /// Replace a charged estimate with the actual cost.
    pub fn settle(&mut self, estimate: f64, actual: f64, now: DateTime<Utc>) {
        if actual.is_finite() && actual >= 0.0 {
            self.charge(actual - estimate, now);
        }
    }
}
