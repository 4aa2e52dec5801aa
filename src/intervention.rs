//! Curator: heuristic signals over a decision and a rate-limited, bounded reorder.
//!
//! Each signal is a small pure function of the decision and its candidates. The monitor
//! intervenes only when the share of triggered signals reaches the configured threshold
//! *and* the token bucket yields a token; otherwise it returns the decision unchanged,
//! annotated `advice_only` with the signals it computed.
//!
//! The reorder spreads similar candidates apart (shared tags, kind, duration band) but
//! never moves anything more than `max_displacement` positions: each candidate `i` must
//! land in `[i - d, i + d]`, and the greedy placement below always places the oldest
//! unplaced candidate once its deadline `i + d` is reached.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    Candidate, CuratorPolicy, DecisionEntry, InterventionNote, InterventionStatus,
    PolicySnapshot, SelectionDecision, SkipReason, TokenBucket,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Some tag repeats across too many chosen candidates.
    TagDuplication,
    /// Perturbed scores are nearly flat.
    ScoreDiversity,
    /// Too many candidates share a duration band or a kind.
    TemporalClustering,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub triggered: bool,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// Measured quantity (count, variance or fraction).
    pub observed: f64,
    pub threshold: f64,
}

/// Candidate metadata for the window under review.
#[derive(Debug, Clone)]
pub struct WindowContext<'a> {
    candidates: HashMap<&'a str, &'a Candidate>,
    now: DateTime<Utc>,
}

impl<'a> WindowContext<'a> {
    pub fn new(candidates: &'a [Candidate], now: DateTime<Utc>) -> Self {
        Self {
            candidates: candidates.iter().map(|c| (c.id.as_str(), c)).collect(),
            now,
        }
    }

    pub fn candidate(&self, id: &str) -> Option<&'a Candidate> {
        self.candidates.get(id).copied()
    }

    /// Wall clock used for token refill.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// What the signals and the reorder know about one entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile<'a> {
    pub tags: Option<&'a BTreeSet<String>>,
    pub kind: Option<&'a str>,
    pub band: Option<u32>,
}

impl<'a> Profile<'a> {
    fn of(entry: &DecisionEntry, ctx: &WindowContext<'a>, band_secs: u32) -> Self {
        match ctx.candidate(&entry.id) {
            Some(c) => Self {
                tags: Some(&c.tags),
                kind: (!c.kind.is_empty()).then_some(c.kind.as_str()),
                band: (c.duration_estimate_secs > 0)
                    .then(|| c.duration_estimate_secs / band_secs.max(1)),
            },
            None => Self::default(),
        }
    }

    fn similarity(&self, other: &Profile<'_>) -> u32 {
        let shared = match (self.tags, other.tags) {
            (Some(a), Some(b)) => a.intersection(b).count() as u32,
            _ => 0,
        };
        let kind = u32::from(self.kind.is_some() && self.kind == other.kind);
        let band = u32::from(self.band.is_some() && self.band == other.band);
        shared + kind + band
    }
}

fn tag_duplication(profiles: &[Profile<'_>], threshold: usize) -> Signal {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for tags in profiles.iter().filter_map(|p| p.tags) {
        for t in tags {
            *counts.entry(t.as_str()).or_default() += 1;
        }
    }
    let max = counts.values().copied().max().unwrap_or(0);
    Signal {
        kind: SignalKind::TagDuplication,
        triggered: max >= threshold,
        confidence: (max as f64 / profiles.len() as f64).min(1.0),
        observed: max as f64,
        threshold: threshold as f64,
    }
}

fn score_diversity(entries: &[DecisionEntry], min_variance: f64) -> Signal {
    let n = entries.len() as f64;
    let mean = entries.iter().map(|e| e.perturbed).sum::<f64>() / n;
    let var = entries
        .iter()
        .map(|e| (e.perturbed - mean).powi(2))
        .sum::<f64>()
        / n;
    // Non-finite spread is not low diversity; keep `observed` serializable.
    let var = if var.is_finite() { var } else { f64::MAX };
    let triggered = var < min_variance;
    Signal {
        kind: SignalKind::ScoreDiversity,
        triggered,
        confidence: if triggered {
            (1.0 - var / min_variance).clamp(0.0, 1.0)
        } else {
            0.0
        },
        observed: var,
        threshold: min_variance,
    }
}

fn modal_fraction<T: Ord>(values: impl Iterator<Item = T>, n: usize) -> f64 {
    let mut counts: BTreeMap<T, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    counts.values().copied().max().unwrap_or(0) as f64 / n as f64
}

fn temporal_clustering(profiles: &[Profile<'_>], threshold: f64) -> Signal {
    let n = profiles.len();
    let by_band = modal_fraction(profiles.iter().filter_map(|p| p.band), n);
    let by_kind = modal_fraction(profiles.iter().filter_map(|p| p.kind), n);
    let fraction = by_band.max(by_kind);
    Signal {
        kind: SignalKind::TemporalClustering,
        triggered: fraction >= threshold,
        confidence: fraction,
        observed: fraction,
        threshold,
    }
}

/// Evaluate all signals. Returns none for decisions shorter than two entries.
pub fn evaluate_signals(
    entries: &[DecisionEntry],
    profiles: &[Profile<'_>],
    cfg: &CuratorPolicy,
    min_diversity: f64,
) -> Vec<Signal> {
    if entries.len() < 2 {
        return Vec::new();
    }
    vec![
        tag_duplication(profiles, cfg.tag_repeat_threshold),
        score_diversity(entries, min_diversity),
        temporal_clustering(profiles, cfg.clustering_threshold),
    ]
}

/// Triggered / evaluated, `0` when nothing was evaluated.
pub fn aggregate_confidence(signals: &[Signal]) -> f64 {
    if signals.is_empty() {
        return 0.0;
    }
    signals.iter().filter(|s| s.triggered).count() as f64 / signals.len() as f64
}

/// Diversity-greedy permutation (`order[new] = old`) with `|new - old| <= max_displacement`.
pub fn bounded_reorder(profiles: &[Profile<'_>], max_displacement: usize) -> Vec<usize> {
    let n = profiles.len();
    let d = max_displacement;
    let mut placed = vec![false; n];
    let mut order: Vec<usize> = Vec::with_capacity(n);

    for pos in 0..n {
        let oldest = (0..n).find(|&i| !placed[i]).unwrap_or(pos);
        let pick = if oldest + d <= pos {
            oldest
        } else {
            let hi = (pos + d).min(n - 1);
            let last = order.last().map(|&i| &profiles[i]);
            let prev = order.len().checked_sub(2).map(|j| &profiles[order[j]]);
            (oldest..=hi)
                .filter(|&i| !placed[i])
                .min_by_key(|&i| {
                    let p = &profiles[i];
                    let penalty = 2 * last.map_or(0, |l| p.similarity(l))
                        + prev.map_or(0, |q| p.similarity(q));
                    (penalty, i)
                })
                .unwrap_or(oldest)
        };
        placed[pick] = true;
        order.push(pick);
    }
    order
}

/// Rate-limited curator. Owns its token bucket.
#[derive(Debug)]
pub struct InterventionMonitor {
    bucket: Mutex<TokenBucket>,
}

impl InterventionMonitor {
    pub fn new(cfg: &CuratorPolicy, now: DateTime<Utc>) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::from_policy(&cfg.token_bucket, now)),
        }
    }

    /// Tokens available at `now`.
    pub fn tokens(&self, now: DateTime<Utc>) -> f64 {
        self.bucket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .available(now)
    }

    fn withdraw(&self, cfg: &CuratorPolicy, now: DateTime<Utc>) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.reconfigure(&cfg.token_bucket, now);
        bucket.try_withdraw(1.0, now)
    }

    #[must_use]
    pub fn review(
        &self,
        decision: SelectionDecision,
        ctx: &WindowContext<'_>,
        policy: &PolicySnapshot,
    ) -> SelectionDecision {
        let cfg = policy.curator();
        if !cfg.enabled || decision.is_empty() {
            return decision;
        }

        let profiles: Vec<Profile<'_>> = decision
            .entries()
            .iter()
            .map(|e| Profile::of(e, ctx, cfg.duration_band_seconds))
            .collect();
        let signals = evaluate_signals(
            decision.entries(),
            &profiles,
            cfg,
            policy.safety().min_diversity,
        );
        let confidence = aggregate_confidence(&signals);
        let note = |status: InterventionStatus, skip_reason: Option<SkipReason>, moved: usize| InterventionNote {
            status,
            skip_reason,
            confidence,
            threshold: cfg.confidence_threshold,
            signals: signals.clone(),
            max_displacement: cfg.max_displacement,
            moved,
        };

        if signals.is_empty() || confidence < cfg.confidence_threshold {
            tracing::debug!(
                window_id = decision.window_id(),
                confidence,
                threshold = cfg.confidence_threshold,
                "curator: advice only, confidence below threshold"
            );
            let n = note(InterventionStatus::AdviceOnly, Some(SkipReason::LowConfidence), 0);
            return decision.with_intervention(n);
        }
        if !self.withdraw(cfg, ctx.now()) {
            tracing::info!(
                window_id = decision.window_id(),
                confidence,
                "curator: advice only, token bucket empty"
            );
            let n = note(InterventionStatus::AdviceOnly, Some(SkipReason::RateLimited), 0);
            return decision.with_intervention(n);
        }

        let order = bounded_reorder(&profiles, cfg.max_displacement);
        let moved = order.iter().enumerate().filter(|(p, o)| p != *o).count();
        tracing::info!(
            window_id = decision.window_id(),
            confidence,
            moved,
            max_displacement = cfg.max_displacement,
            "curator intervened"
        );
        let n = note(InterventionStatus::Applied, None, moved);
        decision.reordered(&order).with_intervention(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{snapshot, snapshot_with, t0, varied_candidates};
    use crate::select;
    use proptest::prelude::*;

    fn tagged(tag: &str, kind: &'static str) -> Profile<'static> {
        let tags: &'static BTreeSet<String> = Box::leak(Box::new(BTreeSet::from([tag.to_string()])));
        Profile {
            tags: Some(tags),
            kind: Some(kind),
            band: None,
        }
    }

    fn ab_profiles() -> Vec<Profile<'static>> {
        let a = tagged("rock", "music");
        let b = tagged("news", "talk");
        vec![a.clone(), a.clone(), a, b.clone(), b.clone(), b]
    }

    #[test]
    fn reorder_interleaves_similar_items() {
        assert_eq!(bounded_reorder(&ab_profiles(), 4), vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn reorder_respects_tight_displacement() {
        assert_eq!(bounded_reorder(&ab_profiles(), 1), vec![0, 1, 3, 2, 4, 5]);
        assert_eq!(bounded_reorder(&ab_profiles(), 0), vec![0, 1, 2, 3, 4, 5]);
    }

    fn clustered() -> Vec<Candidate> {
        (0..8)
            .map(|i| {
                Candidate::new(format!("r{i}"), 0.8 - i as f64 * 0.01)
                    .with_kind("music")
                    .with_tags(["rock"])
                    .with_duration(200)
            })
            .collect()
    }

    #[test]
    fn clustered_window_triggers_and_bucket_limits_interventions() {
        let policy = snapshot();
        let cands = clustered();
        let monitor = InterventionMonitor::new(policy.curator(), t0());
        let ctx = WindowContext::new(&cands, t0());

        let mut statuses = Vec::new();
        for w in 0..3 {
            let d = select(&cands, &policy, t0(), &format!("w{w}")).unwrap();
            let out = monitor.review(d, &ctx, &policy);
            let note = out.intervention().unwrap().clone();
            assert!(note.confidence >= 2.0 / 3.0 - 1e-12);
            assert_eq!(note.signals.len(), 3);
            statuses.push((note.status, note.skip_reason));
        }
        assert_eq!(
            statuses,
            vec![
                (InterventionStatus::Applied, None),
                (InterventionStatus::Applied, None),
                (InterventionStatus::AdviceOnly, Some(SkipReason::RateLimited)),
            ]
        );

        // One token per hour.
        let later = WindowContext::new(&cands, t0() + chrono::Duration::hours(1));
        let d = select(&cands, &policy, t0(), "w9").unwrap();
        assert!(monitor.review(d, &later, &policy).intervention().unwrap().applied());
    }

    #[test]
    fn varied_window_is_advice_only_and_unchanged() {
        let policy = snapshot();
        let cands = varied_candidates();
        let monitor = InterventionMonitor::new(policy.curator(), t0());
        let d = select(&cands, &policy, t0(), "main").unwrap();
        let before = d.clone();
        let out = monitor.review(d, &WindowContext::new(&cands, t0()), &policy);
        let note = out.intervention().unwrap();
        assert_eq!(note.status, InterventionStatus::AdviceOnly);
        assert_eq!(note.skip_reason, Some(SkipReason::LowConfidence));
        assert_eq!(out.ids(), before.ids());
        // Low confidence never spends a token.
        assert!((monitor.tokens(t0()) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn disabled_curator_leaves_no_annotation() {
        let policy = snapshot_with(|d| d.curator_vigilante.enabled = false);
        let cands = clustered();
        let monitor = InterventionMonitor::new(policy.curator(), t0());
        let d = select(&cands, &policy, t0(), "main").unwrap();
        let out = monitor.review(d, &WindowContext::new(&cands, t0()), &policy);
        assert!(out.intervention().is_none());
    }

    #[test]
    fn aggregate_of_nothing_is_zero() {
        assert_eq!(aggregate_confidence(&[]), 0.0);
    }

    #[test]
    fn flat_scores_trigger_diversity_signal() {
        let entries: Vec<DecisionEntry> = (0..4)
            .map(|i| DecisionEntry {
                id: format!("e{i}"),
                score: 0.5,
                perturbed: 1.0 + i as f64 * 0.01,
            })
            .collect();
        let s = score_diversity(&entries, 0.05);
        assert!(s.triggered);
        assert!(s.confidence > 0.9);
        let s = score_diversity(&entries, 0.0);
        assert!(!s.triggered);
    }

    #[test]
    fn overflowing_spread_stays_serializable() {
        let entries = vec![
            DecisionEntry { id: "hi".into(), score: 0.0, perturbed: 1e200 },
            DecisionEntry { id: "lo".into(), score: 0.0, perturbed: -1e200 },
        ];
        let s = score_diversity(&entries, 0.05);
        assert!(!s.triggered);
        assert_eq!(s.observed, f64::MAX);
        assert!(serde_json::to_string(&s).is_ok());
    }

    proptest! {
        #[test]
        fn reorder_is_a_bounded_permutation(
            shape in proptest::collection::vec((0u8..3, 0u8..3, proptest::option::of(0u32..3)), 0..40),
            d in 0usize..8,
        ) {
            let tag_sets: Vec<BTreeSet<String>> = shape
                .iter()
                .map(|(t, _, _)| BTreeSet::from([format!("t{t}")]))
                .collect();
            let kinds = ["a", "b", "c"];
            let profiles: Vec<Profile<'_>> = shape
                .iter()
                .zip(&tag_sets)
                .map(|((_, k, band), tags)| Profile {
                    tags: Some(tags),
                    kind: Some(kinds[*k as usize]),
                    band: *band,
                })
                .collect();
            let order = bounded_reorder(&profiles, d);
            prop_assert_eq!(order.len(), profiles.len());
            let mut seen = order.clone();
            seen.sort_unstable();
            prop_assert_eq!(seen, (0..profiles.len()).collect::<Vec<_>>());
            for (new, old) in order.iter().enumerate() {
                prop_assert!(new.abs_diff(*old) <= d, "moved {old} -> {new} with d={d}");
            }
        }
    }
}
