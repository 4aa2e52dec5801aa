//! Circuit breaker as an explicit finite-state machine.
//!
//! [`transition`] is the whole state machine: a pure function from (state, event) to the
//! next state. [`CircuitBreaker`] owns the rolling outcome window and turns recorded
//! outcomes and clock readings into events. It never performs or awaits a call itself,
//! so the same machine works however the call is scheduled.
//!
//! ```text
//!            window trips                     recovery timeout elapsed
//!   Closed ───────────────▶ Open ─────────────────────────────────▶ HalfOpen
//!     ▲                      ▲                                         │
//!     │                      └──────────── trial failed ◀──────────────┤
//!     └───────────────────────────────── trial succeeded ◀─────────────┘
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::BreakerPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Inputs of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Closed window reached the failure threshold.
    WindowTripped,
    RecoveryElapsed,
    TrialSucceeded,
    TrialFailed,
}

/// Pure transition function. Events that do not apply to a state leave it unchanged.
pub fn transition(state: BreakerState, event: BreakerEvent) -> BreakerState {
    use BreakerEvent::*;
    use BreakerState::*;
    match (state, event) {
        (Closed, WindowTripped) => Open,
        (Open, RecoveryElapsed) => HalfOpen,
        (HalfOpen, TrialSucceeded) => Closed,
        (HalfOpen, TrialFailed) => Open,
        (s, _) => s,
    }
}

/// Result of a single attempt, as recorded by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
}

impl CallOutcome {
    pub fn is_failure(self) -> bool {
        !matches!(self, CallOutcome::Success)
    }
}

/// Whether a call may be attempted now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal attempt in the closed state.
    Attempt,
    /// The single half-open trial call.
    Trial,
    /// Open, or half-open with the trial already taken.
    Rejected,
}

impl Admission {
    pub fn allowed(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: f64,
    pub window_size: usize,
    pub min_calls: usize,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerPolicy::default())
    }
}

impl From<&BreakerPolicy> for BreakerConfig {
    fn from(p: &BreakerPolicy) -> Self {
        Self {
            failure_threshold: p.failure_threshold,
            window_size: p.window_size.max(1),
            min_calls: p.min_calls.max(1),
            recovery_timeout: Duration::seconds(p.recovery_timeout_seconds as i64),
        }
    }
}

/// Point-in-time view for logs and the operator surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub attempts: usize,
    pub failures: usize,
    pub last_transition: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    state: BreakerState,
    /// `true` = failure. Oldest first.
    window: VecDeque<bool>,
    last_transition: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            state: BreakerState::Closed,
            window: VecDeque::with_capacity(cfg.window_size),
            last_transition: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn config(&self) -> BreakerConfig {
        self.cfg
    }

    /// Apply new thresholds (e.g. after a policy reload). State is kept; a shrunken
    /// window drops its oldest outcomes.
    pub fn reconfigure(&mut self, cfg: BreakerConfig) {
        self.cfg = cfg;
        while self.window.len() > cfg.window_size {
            self.window.pop_front();
        }
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|f| **f).count();
        failures as f64 / self.window.len() as f64
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            attempts: self.window.len(),
            failures: self.window.iter().filter(|f| **f).count(),
            last_transition: self.last_transition,
        }
    }

    fn recovery_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_transition {
            Some(at) => now - at >= self.cfg.recovery_timeout,
            None => true,
        }
    }

    /// What [`admit`](Self::admit) would answer, without changing anything.
    pub fn peek(&self, now: DateTime<Utc>) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Attempt,
            BreakerState::Open if self.recovery_elapsed(now) => Admission::Trial,
            BreakerState::Open => Admission::Rejected,
            BreakerState::HalfOpen if self.trial_in_flight => Admission::Rejected,
            BreakerState::HalfOpen => Admission::Trial,
        }
    }

    /// Admit a call. An open breaker whose recovery timeout has elapsed moves to
    /// half-open and hands out its single trial.
    pub fn admit(&mut self, now: DateTime<Utc>) -> Admission {
        if self.state == BreakerState::Open && self.recovery_elapsed(now) {
            self.apply(BreakerEvent::RecoveryElapsed, now);
        }
        let admission = self.peek(now);
        if admission == Admission::Trial {
            self.trial_in_flight = true;
        }
        admission
    }

    /// Record the outcome of an admitted call.
    pub fn record(&mut self, outcome: CallOutcome, now: DateTime<Utc>) {
        match self.state {
            BreakerState::HalfOpen => {
                self.trial_in_flight = false;
                if outcome.is_failure() {
                    self.apply(BreakerEvent::TrialFailed, now);
                } else {
                    self.window.clear();
                    self.apply(BreakerEvent::TrialSucceeded, now);
                }
            }
            BreakerState::Closed => {
                if self.window.len() == self.cfg.window_size {
                    self.window.pop_front();
                }
                self.window.push_back(outcome.is_failure());
                if self.window.len() >= self.cfg.min_calls
                    && self.failure_ratio() >= self.cfg.failure_threshold
                {
                    self.apply(BreakerEvent::WindowTripped, now);
                }
            }
            // A call admitted while closed can finish after a concurrent one opened the
            // breaker; it no longer carries information about recovery.
            BreakerState::Open => {}
        }
    }

    fn apply(&mut self, event: BreakerEvent, now: DateTime<Utc>) {
        let next = transition(self.state, event);
        if next != self.state {
            tracing::info!(
                from = ?self.state,
                to = ?next,
                event = ?event,
                failure_ratio = self.failure_ratio(),
                "circuit breaker transition"
            );
            self.state = next;
            self.last_transition = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 0.2,
            window_size: 50,
            min_calls: 3,
            recovery_timeout: Duration::seconds(60),
        }
    }

    #[test]
    fn transition_table() {
        use BreakerEvent::*;
        use BreakerState::*;
        assert_eq!(transition(Closed, WindowTripped), Open);
        assert_eq!(transition(Open, RecoveryElapsed), HalfOpen);
        assert_eq!(transition(HalfOpen, TrialSucceeded), Closed);
        assert_eq!(transition(HalfOpen, TrialFailed), Open);
        assert_eq!(transition(Closed, TrialFailed), Closed);
        assert_eq!(transition(Open, TrialSucceeded), Open);
    }

    #[test]
    fn three_timeouts_open_the_breaker() {
        let mut b = CircuitBreaker::new(cfg());
        for i in 0..3 {
            assert_eq!(b.admit(t0()), Admission::Attempt);
            b.record(CallOutcome::Timeout, t0() + Duration::seconds(i));
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.peek(t0() + Duration::seconds(30)), Admission::Rejected);
    }

    #[test]
    fn ratio_below_threshold_stays_closed() {
        let mut b = CircuitBreaker::new(cfg());
        for _ in 0..20 {
            b.admit(t0());
            b.record(CallOutcome::Success, t0());
        }
        for _ in 0..4 {
            b.admit(t0());
            b.record(CallOutcome::Failure, t0());
        }
        // 4 / 24 < 0.2
        assert_eq!(b.state(), BreakerState::Closed);
        b.admit(t0());
        b.record(CallOutcome::Failure, t0());
        // 5 / 25 = 0.2
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn half_open_allows_exactly_one_trial() {
        let mut b = CircuitBreaker::new(cfg());
        for _ in 0..3 {
            b.admit(t0());
            b.record(CallOutcome::Failure, t0());
        }
        let later = t0() + Duration::seconds(61);
        assert_eq!(b.admit(later), Admission::Trial);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(b.admit(later), Admission::Rejected);

        b.record(CallOutcome::Success, later);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().attempts, 0);
    }

    #[test]
    fn failed_trial_reopens_and_restarts_timer() {
        let mut b = CircuitBreaker::new(cfg());
        for _ in 0..3 {
            b.admit(t0());
            b.record(CallOutcome::Failure, t0());
        }
        let trial_at = t0() + Duration::seconds(61);
        assert_eq!(b.admit(trial_at), Admission::Trial);
        b.record(CallOutcome::Timeout, trial_at);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.peek(trial_at + Duration::seconds(59)), Admission::Rejected);
        assert_eq!(b.peek(trial_at + Duration::seconds(60)), Admission::Trial);
    }

    #[test]
    fn window_is_bounded() {
        let mut b = CircuitBreaker::new(BreakerConfig {
            window_size: 5,
            ..cfg()
        });
        for _ in 0..50 {
            b.admit(t0());
            b.record(CallOutcome::Success, t0());
        }
        assert_eq!(b.snapshot().attempts, 5);
    }
}
