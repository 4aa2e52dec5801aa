//! Autopilot: a slow outer loop that nudges policy knobs from outcome metrics.
//!
//! Rules live in the policy (`autopilot.rules`). On each run the controller folds the new
//! metrics into a short rolling history, finds the first rule whose condition holds on
//! the rolling mean, and checks the proposed step against the cadence, the per-knob
//! daily variation budget and the knob's bounds. A step that fails any check is a no-op
//! with a reason; it is never clamped into range.
//!
//! Accepted steps are written through [`ConfigStore::submit`] against the revision the
//! proposal was computed from, so an operator reload in between wins.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChangeOrigin, ConfigError, ConfigStore, Knob, PolicySnapshot};

/// Default number of metric samples in the rolling mean.
pub const DEFAULT_HISTORY_CAP: usize = 12;

const VARIATION_EPS: f64 = 1e-9;

/// One batch of aggregated outcome metrics (e.g. `retention`, `diversity`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeMetrics {
    pub at: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl OutcomeMetrics {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            at,
            values: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.values.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposedAdjustment {
    pub knob: Knob,
    pub from: f64,
    pub to: f64,
    pub delta: f64,
    pub metric: String,
    /// Rolling mean that fired the rule.
    pub observed: f64,
    pub reason: String,
    /// Policy revision the proposal was computed from.
    pub base_revision: u64,
}

/// Why a run did not change the policy.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackRejection {
    #[error("autopilot disabled")]
    Disabled,

    #[error("no rule fired")]
    NoRuleFired,

    #[error("cadence not elapsed, next adjustment allowed at {next}")]
    Cadence { next: DateTime<Utc> },

    #[error("daily variation of {knob:?} would reach {would_be} (limit {limit})")]
    DailyLimit { knob: Knob, would_be: f64, limit: f64 },

    #[error("{knob:?} would move to {value}, outside [{min}, {max}]")]
    OutOfBounds {
        knob: Knob,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("policy moved from revision {expected} to {active} since the proposal")]
    Conflict { expected: u64, active: u64 },

    #[error("proposed policy rejected: {message}")]
    Invalid { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Propose(ProposedAdjustment),
    NoOp(FeedbackRejection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackOutcome {
    Applied {
        adjustment: ProposedAdjustment,
        revision: u64,
    },
    Rejected {
        adjustment: Option<ProposedAdjustment>,
        reason: FeedbackRejection,
    },
}

impl FeedbackOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, FeedbackOutcome::Applied { .. })
    }
}

/// Controller-private state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackState {
    pub last_applied_at: Option<DateTime<Utc>>,
    /// UTC day `applied_today` refers to.
    pub day: Option<NaiveDate>,
    /// Sum of absolute applied deltas per knob on `day`.
    pub applied_today: BTreeMap<Knob, f64>,
    pub history: VecDeque<OutcomeMetrics>,
}

impl FeedbackState {
    fn used_on(&self, knob: Knob, today: NaiveDate) -> f64 {
        if self.day == Some(today) {
            self.applied_today.get(&knob).copied().unwrap_or(0.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackController {
    state: FeedbackState,
    history_cap: usize,
}

impl Default for FeedbackController {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackController {
    pub fn new() -> Self {
        Self::with_history_cap(DEFAULT_HISTORY_CAP)
    }

    pub fn with_history_cap(history_cap: usize) -> Self {
        Self {
            state: FeedbackState::default(),
            history_cap: history_cap.max(1),
        }
    }

    pub fn state(&self) -> &FeedbackState {
        &self.state
    }

    /// Append a metrics batch to the rolling history.
    pub fn observe(&mut self, metrics: OutcomeMetrics) {
        if self.state.history.len() == self.history_cap {
            self.state.history.pop_front();
        }
        self.state.history.push_back(metrics);
    }

    /// Mean of `metric` over the rolling history, if it was ever reported.
    pub fn rolling(&self, metric: &str) -> Option<f64> {
        let (sum, n) = self
            .state
            .history
            .iter()
            .filter_map(|m| m.values.get(metric).copied())
            .filter(|v| v.is_finite())
            .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        (n > 0).then(|| sum / n as f64)
    }

    /// Fold in `metrics` and propose at most one adjustment.
    pub fn evaluate(
        &mut self,
        metrics: OutcomeMetrics,
        policy: &PolicySnapshot,
        now: DateTime<Utc>,
    ) -> Evaluation {
        self.observe(metrics);
        self.propose(policy, now)
    }

    /// Proposal from the current history, without recording anything.
    pub fn propose(&self, policy: &PolicySnapshot, now: DateTime<Utc>) -> Evaluation {
        let cfg = policy.autopilot();
        if !cfg.enabled {
            return Evaluation::NoOp(FeedbackRejection::Disabled);
        }

        let fired = cfg.rules.iter().find_map(|rule| {
            let observed = self.rolling(&rule.metric)?;
            rule.comparator
                .holds(observed, rule.threshold)
                .then_some((rule, observed))
        });
        let Some((rule, observed)) = fired else {
            return Evaluation::NoOp(FeedbackRejection::NoRuleFired);
        };

        if let Some(last) = self.state.last_applied_at {
            let cadence = Duration::milliseconds((cfg.cadence_hours * 3_600_000.0) as i64);
            if now < last + cadence {
                return Evaluation::NoOp(FeedbackRejection::Cadence {
                    next: last + cadence,
                });
            }
        }

        let knob = rule.knob;
        let would_be = self.state.used_on(knob, now.date_naive()) + rule.delta.abs();
        if would_be > cfg.max_daily_variation + VARIATION_EPS {
            return Evaluation::NoOp(FeedbackRejection::DailyLimit {
                knob,
                would_be,
                limit: cfg.max_daily_variation,
            });
        }

        let from = knob.get(policy.document());
        let to = from + rule.delta;
        let range = knob.range();
        let (min, max) = if knob == Knob::Temperature {
            let s = policy.safety();
            (range.min.max(s.min_temperature), range.max.min(s.max_temperature))
        } else {
            (range.min, range.max)
        };
        if !(to.is_finite() && to >= min && to <= max) {
            return Evaluation::NoOp(FeedbackRejection::OutOfBounds {
                knob,
                value: to,
                min,
                max,
            });
        }

        Evaluation::Propose(ProposedAdjustment {
            knob,
            from,
            to,
            delta: rule.delta,
            metric: rule.metric.clone(),
            observed,
            reason: rule.reason.clone(),
            base_revision: policy.revision(),
        })
    }

    /// One autopilot tick: evaluate against the active policy and submit the result.
    pub fn run(
        &mut self,
        store: &ConfigStore,
        metrics: OutcomeMetrics,
        now: DateTime<Utc>,
    ) -> FeedbackOutcome {
        let policy = store.snapshot();
        let adjustment = match self.evaluate(metrics, &policy, now) {
            Evaluation::Propose(a) => a,
            Evaluation::NoOp(reason) => {
                match &reason {
                    FeedbackRejection::Disabled | FeedbackRejection::NoRuleFired => {
                        tracing::debug!(%reason, "autopilot: no-op")
                    }
                    _ => tracing::warn!(%reason, "autopilot: adjustment rejected"),
                }
                return FeedbackOutcome::Rejected {
                    adjustment: None,
                    reason,
                };
            }
        };

        self.apply(store, &policy, adjustment, now)
    }

    /// Submit a proposal computed from `policy`. Rejected if the store has moved past
    /// `policy`'s revision since.
    pub fn apply(
        &mut self,
        store: &ConfigStore,
        policy: &PolicySnapshot,
        adjustment: ProposedAdjustment,
        now: DateTime<Utc>,
    ) -> FeedbackOutcome {
        let mut doc = policy.document().clone();
        adjustment.knob.set(&mut doc, adjustment.to);
        let origin = ChangeOrigin::Autopilot {
            reason: format!(
                "{} ({} = {:.4}): {:?} {:+}",
                adjustment.reason,
                adjustment.metric,
                adjustment.observed,
                adjustment.knob,
                adjustment.delta
            ),
        };
        match store.submit(doc, adjustment.base_revision, origin, now) {
            Ok(snap) => {
                let today = now.date_naive();
                if self.state.day != Some(today) {
                    self.state.day = Some(today);
                    self.state.applied_today.clear();
                }
                *self.state.applied_today.entry(adjustment.knob).or_default() +=
                    adjustment.delta.abs();
                self.state.last_applied_at = Some(now);
                tracing::info!(
                    knob = ?adjustment.knob,
                    from = adjustment.from,
                    to = adjustment.to,
                    metric = %adjustment.metric,
                    observed = adjustment.observed,
                    revision = snap.revision(),
                    "autopilot adjustment applied"
                );
                FeedbackOutcome::Applied {
                    adjustment,
                    revision: snap.revision(),
                }
            }
            Err(e) => {
                let reason = match e {
                    ConfigError::VersionConflict { expected, active } => {
                        FeedbackRejection::Conflict { expected, active }
                    }
                    other => FeedbackRejection::Invalid {
                        message: other.to_string(),
                    },
                };
                tracing::warn!(%reason, knob = ?adjustment.knob, "autopilot: adjustment rejected");
                FeedbackOutcome::Rejected {
                    adjustment: Some(adjustment),
                    reason,
                }
            }
        }
    }
}
