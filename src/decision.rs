//! Decision envelope for one slot.
//!
//! A [`SelectionDecision`] is created once by the selection engine and then handed down
//! the pipeline by value. Later stages never edit it in place: they consume it and
//! return a new value carrying their annotation (and, when they act, a new order).
//! Annotations are typed and small; prefer adding new variants over changing the
//! meaning of existing ones, since recorded audit lines must stay readable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BreakerState, Signal};

/// One ranked candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub id: String,
    /// Base score as supplied by the pipeline.
    pub score: f64,
    /// `(score + bias) / temperature + gumbel`.
    pub perturbed: f64,
}

/// What happened to the advisory re-rank for this slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryStatus {
    /// Suggestion met the confidence threshold and replaced the base order.
    Applied,
    /// Suggestion below the confidence threshold; recorded, not applied.
    AdvisoryOnly,
    /// Breaker open (or half-open with its trial already taken); no call attempted.
    CircuitOpen,
    /// Hourly spend budget exhausted; no call attempted.
    BudgetExceeded,
    /// Call exceeded its deadline.
    TimedOut,
    /// Call failed or returned an unusable order.
    CallFailed,
}

/// Advisory annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryNote {
    /// Advisor identity (empty when no call was made).
    pub source: String,
    pub status: AdvisoryStatus,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_order: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Breaker state after this attempt (or skip).
    pub breaker: BreakerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    Applied,
    AdviceOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Aggregate signal confidence below the configured threshold.
    LowConfidence,
    /// Token bucket empty.
    RateLimited,
}

/// Curator annotation. Signals are kept whether or not the curator acted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionNote {
    pub status: InterventionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Triggered signals / evaluated signals.
    pub confidence: f64,
    pub threshold: f64,
    pub signals: Vec<Signal>,
    pub max_displacement: usize,
    /// Number of entries whose position changed.
    pub moved: usize,
}

impl InterventionNote {
    pub fn applied(&self) -> bool {
        self.status == InterventionStatus::Applied
    }
}

/// The outcome of one selection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionDecision {
    policy_version: String,
    policy_revision: u64,
    window_id: String,
    slot_start: DateTime<Utc>,
    decided_at: DateTime<Utc>,
    seed: u64,
    temperature: f64,
    entries: Vec<DecisionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    explored: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    advisory: Option<AdvisoryNote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    intervention: Option<InterventionNote>,
}

/// Everything the selection engine fixes about a decision.
pub(crate) struct DecisionParts {
    pub policy_version: String,
    pub policy_revision: u64,
    pub window_id: String,
    pub slot_start: DateTime<Utc>,
    pub decided_at: DateTime<Utc>,
    pub seed: u64,
    pub temperature: f64,
    pub entries: Vec<DecisionEntry>,
    pub explored: Option<String>,
}

impl SelectionDecision {
    pub(crate) fn new(parts: DecisionParts) -> Self {
        Self {
            policy_version: parts.policy_version,
            policy_revision: parts.policy_revision,
            window_id: parts.window_id,
            slot_start: parts.slot_start,
            decided_at: parts.decided_at,
            seed: parts.seed,
            temperature: parts.temperature,
            entries: parts.entries,
            explored: parts.explored,
            advisory: None,
            intervention: None,
        }
    }

    pub fn policy_version(&self) -> &str {
        &self.policy_version
    }

    pub fn policy_revision(&self) -> u64 {
        self.policy_revision
    }

    pub fn window_id(&self) -> &str {
        &self.window_id
    }

    pub fn slot_start(&self) -> DateTime<Utc> {
        self.slot_start
    }

    /// The requested slot time, not the wall clock: decisions must replay byte-for-byte.
    pub fn decided_at(&self) -> DateTime<Utc> {
        self.decided_at
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Temperature actually applied (after the numerical floor).
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn entries(&self) -> &[DecisionEntry] {
        &self.entries
    }

    /// Ordered candidate ids.
    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Candidate swapped in by epsilon exploration, if any.
    pub fn explored(&self) -> Option<&str> {
        self.explored.as_deref()
    }

    pub fn advisory(&self) -> Option<&AdvisoryNote> {
        self.advisory.as_ref()
    }

    pub fn intervention(&self) -> Option<&InterventionNote> {
        self.intervention.as_ref()
    }

    pub(crate) fn with_advisory(mut self, note: AdvisoryNote) -> Self {
        self.advisory = Some(note);
        self
    }

    pub(crate) fn with_intervention(mut self, note: InterventionNote) -> Self {
        self.intervention = Some(note);
        self
    }

    /// Reorder by a permutation of current indices (`order[new_pos] = old_pos`).
    ///
    /// Callers guarantee `order` is a permutation of `0..len`.
    pub(crate) fn reordered(mut self, order: &[usize]) -> Self {
        debug_assert_eq!(order.len(), self.entries.len());
        let old = std::mem::take(&mut self.entries);
        let mut slots: Vec<Option<DecisionEntry>> = old.into_iter().map(Some).collect();
        self.entries = order.iter().filter_map(|&i| slots[i].take()).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn decision(ids: &[&str]) -> SelectionDecision {
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap();
        SelectionDecision::new(DecisionParts {
            policy_version: "2025.03".to_string(),
            policy_revision: 1,
            window_id: "main".to_string(),
            slot_start: t,
            decided_at: t,
            seed: 9,
            temperature: 0.5,
            entries: ids
                .iter()
                .enumerate()
                .map(|(i, id)| DecisionEntry {
                    id: id.to_string(),
                    score: 1.0 - i as f64 * 0.1,
                    perturbed: 2.0 - i as f64 * 0.1,
                })
                .collect(),
            explored: None,
        })
    }

    #[test]
    fn reordered_applies_permutation_and_keeps_scores() {
        let d = decision(&["a", "b", "c"]).reordered(&[2, 0, 1]);
        assert_eq!(d.ids(), vec!["c", "a", "b"]);
        assert!((d.entries()[0].score - 0.8).abs() < 1e-12);
    }

    #[test]
    fn optional_annotations_are_omitted_from_json() {
        let json = serde_json::to_string(&decision(&["a"])).unwrap();
        assert!(!json.contains("advisory"), "{json}");
        assert!(!json.contains("intervention"), "{json}");
        assert!(!json.contains("explored"), "{json}");
    }

    #[test]
    fn advisory_status_serializes_snake_case() {
        let s = serde_json::to_string(&AdvisoryStatus::CircuitOpen).unwrap();
        assert_eq!(s, "\"circuit_open\"");
        let s = serde_json::to_string(&InterventionStatus::AdviceOnly).unwrap();
        assert_eq!(s, "\"advice_only\"");
    }
}
