//! `slotmux`: deterministic, policy-driven slot selection with guarded refinement layers.
//!
//! One selection cycle runs per slot (a fixed-duration scheduling window) and produces a
//! [`SelectionDecision`]: an ordered subset of the candidates the processing pipeline
//! offered for that slot.
//!
//! ```text
//! ConfigStore::snapshot()          immutable, validated policy revision
//!   -> select()                    seeded Gumbel-Top-k (deterministic base order)
//!   -> AdvisoryClient              optional external re-rank: breaker + deadline + budget
//!   -> InterventionMonitor         curator signals, token-bucket gated bounded reorder
//!   -> AuditSink                   signed, append-only record
//! ```
//!
//! A [`FeedbackController`] (autopilot) runs out-of-band on a slow cadence and proposes
//! small knob adjustments, which it can only publish through
//! [`ConfigStore::submit`] (same validation as an operator reload, plus an
//! optimistic revision check).
//!
//! **Goals:**
//! - **Reproducible**: same candidates + policy + slot time + window id → byte-identical
//!   decision. All randomness flows from a seed derived by [`slot_seed`].
//! - **Never blocked by the advisor**: the advisory call is the only await point and is
//!   bounded by a hard deadline; every failure degrades to the base order.
//! - **Bounded influence**: the curator moves no candidate more than `max_displacement`
//!   positions and is rate-limited; the autopilot moves no knob more than
//!   `max_daily_variation` per day.
//! - **Auditable**: every layer annotates the decision instead of silently acting.
//!
//! **Non-goals:**
//! - Not a rules engine or recommender; scores come from outside.
//! - No LLM client: the advisor is a trait ([`Advisor`]) supplied by the caller.
//! - No storage engine: policy history is in memory, audit goes to an [`AuditSink`].

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

mod error;
pub use error::*;

mod policy;
pub use policy::*;

mod store;
pub use store::*;

mod stable_hash;
pub use stable_hash::*;

mod decision;
pub use decision::*;

mod select;
pub use select::*;

mod breaker;
pub use breaker::*;

mod budget;
pub use budget::*;

mod advisory;
pub use advisory::*;

mod bucket;
pub use bucket::*;

mod intervention;
pub use intervention::*;

mod feedback;
pub use feedback::*;

mod audit;
pub use audit::*;

mod cycle;
pub use cycle::*;

#[cfg(test)]
mod test_support;

/// One piece of content offered for a slot by the processing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    /// Base score. Must be finite.
    pub score: f64,
    /// Category (e.g. `"music"`, `"talk"`, `"interstitial"`).
    pub kind: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Estimated duration in seconds.
    #[serde(rename = "duration_estimate")]
    pub duration_estimate_secs: u32,
}

impl Candidate {
    /// Convenience constructor.
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
            kind: String::new(),
            tags: BTreeSet::new(),
            duration_estimate_secs: 0,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_estimate_secs = secs;
        self
    }
}

/// Largest accepted `|score|`. Keeps perturbed scores and their variance finite at the
/// temperature floor.
pub const SCORE_LIMIT: f64 = 1e9;

/// Reject non-finite or out-of-range scores and duplicate ids.
///
/// Runs before any sorting so the comparator never sees a NaN.
pub fn validate_candidates(candidates: &[Candidate]) -> Result<(), SelectionError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(candidates.len());
    for c in candidates {
        if !c.score.is_finite() {
            return Err(SelectionError::NonFiniteScore {
                id: c.id.clone(),
                score: c.score,
            });
        }
        if c.score.abs() > SCORE_LIMIT {
            return Err(SelectionError::ScoreOutOfRange {
                id: c.id.clone(),
                score: c.score,
                limit: SCORE_LIMIT,
            });
        }
        if !seen.insert(c.id.as_str()) {
            return Err(SelectionError::DuplicateCandidate(c.id.clone()));
        }
    }
    Ok(())
}
