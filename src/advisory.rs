//! Optional external re-rank, guarded by a circuit breaker, a hard deadline and an hourly
//! spend budget.
//!
//! The advisor is the only thing in a cycle that can be slow, so [`AdvisoryClient`] never
//! lets it decide the outcome of a slot. Every failure mode (open breaker, exhausted
//! budget, deadline, transport error, malformed order) returns the incoming decision
//! unchanged apart from an [`AdvisoryNote`].
//!
//! Breaker and budget state live behind one short-held `std::sync::Mutex` that is never
//! held across the await, so concurrent cycles see a consistent admission decision.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    AdvisoryNote, AdvisoryPolicy, AdvisoryStatus, BreakerConfig, BreakerSnapshot, BreakerState,
    CallOutcome, CircuitBreaker, DecisionEntry, PolicySnapshot, SelectionDecision, SpendBudget,
};

/// What the advisor is asked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdvisoryRequest {
    pub window_id: String,
    pub slot_start: DateTime<Utc>,
    pub policy_version: String,
    /// Base order, best first.
    pub entries: Vec<DecisionEntry>,
    /// Opaque caller context (audience data, recent plays, ...).
    pub payload: serde_json::Value,
}

/// What the advisor answers: a full reordering of the requested ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryResponse {
    pub order: Vec<String>,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub source: String,
    /// Actual cost of the call, when the advisor knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_eur: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdvisoryError {
    #[error("advisory call exceeded its {0:?} deadline")]
    Timeout(StdDuration),

    #[error("advisory call failed: {0}")]
    Call(String),

    #[error("advisory response rejected: {0}")]
    Malformed(String),
}

/// External re-rank service. Implementations own their transport; the client owns
/// deadlines and failure accounting.
#[async_trait]
pub trait Advisor: Send + Sync {
    async fn rerank(&self, request: AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError>;
}

#[derive(Debug)]
struct Guarded {
    breaker: CircuitBreaker,
    budget: SpendBudget,
}

fn lock(m: &Mutex<Guarded>) -> MutexGuard<'_, Guarded> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records a failure if the attempt is dropped before it reports an outcome, so a
/// cancelled cycle still counts against the breaker (and frees a half-open trial).
struct AttemptGuard {
    guarded: Arc<Mutex<Guarded>>,
    started_at: DateTime<Utc>,
    armed: bool,
}

impl AttemptGuard {
    fn finish(mut self, outcome: CallOutcome, at: DateTime<Utc>) -> BreakerState {
        self.armed = false;
        let mut g = lock(&self.guarded);
        g.breaker.record(outcome, at);
        g.breaker.state()
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("advisory attempt cancelled before completion, counting as failure");
            lock(&self.guarded)
                .breaker
                .record(CallOutcome::Failure, self.started_at);
        }
    }
}

/// Guarded caller of an [`Advisor`].
///
/// Cloning shares the breaker and budget.
#[derive(Clone)]
pub struct AdvisoryClient {
    advisor: Arc<dyn Advisor>,
    guarded: Arc<Mutex<Guarded>>,
}

impl std::fmt::Debug for AdvisoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryClient")
            .field("state", &*lock(&self.guarded))
            .finish_non_exhaustive()
    }
}

impl AdvisoryClient {
    pub fn new(advisor: Arc<dyn Advisor>, policy: &AdvisoryPolicy) -> Self {
        Self {
            advisor,
            guarded: Arc::new(Mutex::new(Guarded {
                breaker: CircuitBreaker::new(BreakerConfig::from(&policy.circuit_breaker)),
                budget: SpendBudget::new(policy.max_budget_eur_per_hour),
            })),
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        lock(&self.guarded).breaker.state()
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        lock(&self.guarded).breaker.snapshot()
    }

    /// Budget left in the hour containing `now`.
    pub fn remaining_budget(&self, now: DateTime<Utc>) -> f64 {
        lock(&self.guarded).budget.remaining(now)
    }

    /// Ask the advisor to re-rank `decision`, if the policy enables it and the breaker
    /// and budget allow an attempt.
    ///
    /// Never fails: the worst case is the base order with a note saying why.
    pub async fn maybe_rerank(
        &self,
        decision: SelectionDecision,
        payload: serde_json::Value,
        policy: &PolicySnapshot,
        now: DateTime<Utc>,
    ) -> SelectionDecision {
        let cfg = policy.advisory();
        if !cfg.enabled || decision.is_empty() {
            return decision;
        }

        let cost = cfg.cost_per_call_eur;
        {
            let mut g = lock(&self.guarded);
            g.breaker
                .reconfigure(BreakerConfig::from(&cfg.circuit_breaker));
            g.budget.set_max_per_hour(cfg.max_budget_eur_per_hour);

            if !g.breaker.peek(now).allowed() {
                let state = g.breaker.state();
                drop(g);
                tracing::debug!(window_id = decision.window_id(), "advisory skipped: circuit open");
                return decision.with_advisory(skipped(AdvisoryStatus::CircuitOpen, state));
            }
            if !g.budget.can_afford(cost, now) {
                let state = g.breaker.state();
                let remaining = g.budget.remaining(now);
                drop(g);
                tracing::info!(
                    window_id = decision.window_id(),
                    remaining,
                    cost,
                    "advisory skipped: hourly budget exhausted"
                );
                return decision.with_advisory(skipped(AdvisoryStatus::BudgetExceeded, state));
            }
            if !g.breaker.admit(now).allowed() {
                let state = g.breaker.state();
                return decision.with_advisory(skipped(AdvisoryStatus::CircuitOpen, state));
            }
            g.budget.charge(cost, now);
        }

        let guard = AttemptGuard {
            guarded: Arc::clone(&self.guarded),
            started_at: now,
            armed: true,
        };
        let request = AdvisoryRequest {
            window_id: decision.window_id().to_string(),
            slot_start: decision.slot_start(),
            policy_version: decision.policy_version().to_string(),
            entries: decision.entries().to_vec(),
            payload,
        };
        let deadline = StdDuration::from_secs_f64(cfg.circuit_breaker.timeout_seconds);
        let started = tokio::time::Instant::now();
        let result = match tokio::time::timeout(deadline, self.advisor.rerank(request)).await {
            Ok(r) => r,
            Err(_) => Err(AdvisoryError::Timeout(deadline)),
        };
        let finished_at = now
            + chrono::Duration::from_std(started.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());

        let result = result.and_then(|resp| {
            let order = permutation_of(&decision, &resp)?;
            Ok((resp, order))
        });
        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(AdvisoryError::Timeout(_)) => CallOutcome::Timeout,
            Err(_) => CallOutcome::Failure,
        };
        let breaker = guard.finish(outcome, finished_at);

        match result {
            Ok((resp, order)) => {
                if let Some(actual) = resp.cost_eur {
                    lock(&self.guarded).budget.settle(cost, actual, now);
                }
                let applied = resp.confidence >= cfg.confidence_threshold;
                let note = AdvisoryNote {
                    source: resp.source.clone(),
                    status: if applied {
                        AdvisoryStatus::Applied
                    } else {
                        AdvisoryStatus::AdvisoryOnly
                    },
                    applied,
                    confidence: Some(resp.confidence),
                    suggested_order: (!applied).then(|| resp.order.clone()),
                    error: None,
                    breaker,
                };
                tracing::info!(
                    window_id = decision.window_id(),
                    source = %resp.source,
                    confidence = resp.confidence,
                    threshold = cfg.confidence_threshold,
                    applied,
                    "advisory re-rank received"
                );
                if applied {
                    decision.reordered(&order).with_advisory(note)
                } else {
                    decision.with_advisory(note)
                }
            }
            Err(err) => {
                let status = match err {
                    AdvisoryError::Timeout(_) => AdvisoryStatus::TimedOut,
                    _ => AdvisoryStatus::CallFailed,
                };
                tracing::warn!(
                    window_id = decision.window_id(),
                    error = %err,
                    breaker = ?breaker,
                    "advisory call failed, keeping base order"
                );
                decision.with_advisory(AdvisoryNote {
                    error: Some(err.to_string()),
                    ..skipped(status, breaker)
                })
            }
        }
    }
}

fn skipped(status: AdvisoryStatus, breaker: BreakerState) -> AdvisoryNote {
    AdvisoryNote {
        source: String::new(),
        status,
        applied: false,
        confidence: None,
        suggested_order: None,
        error: None,
        breaker,
    }
}

/// Map the advisor's id order onto current indices (`order[new] = old`).
fn permutation_of(
    decision: &SelectionDecision,
    resp: &AdvisoryResponse,
) -> Result<Vec<usize>, AdvisoryError> {
    if !(resp.confidence.is_finite() && (0.0..=1.0).contains(&resp.confidence)) {
        return Err(AdvisoryError::Malformed(format!(
            "confidence {} outside [0, 1]",
            resp.confidence
        )));
    }
    let entries = decision.entries();
    if resp.order.len() != entries.len() {
        return Err(AdvisoryError::Malformed(format!(
            "expected {} ids, got {}",
            entries.len(),
            resp.order.len()
        )));
    }
    let mut used = vec![false; entries.len()];
    let mut order = Vec::with_capacity(entries.len());
    for id in &resp.order {
        let idx = entries
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| AdvisoryError::Malformed(format!("unknown id {id:?}")))?;
        if std::mem::replace(&mut used[idx], true) {
            return Err(AdvisoryError::Malformed(format!("id {id:?} repeated")));
        }
        order.push(idx);
    }
    Ok(order)
}
