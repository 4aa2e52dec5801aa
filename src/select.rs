//! Seeded Gumbel-Top-k selection.
//!
//! Each candidate gets `adjusted = (score + bias) / max(temperature, TEMPERATURE_FLOOR)`
//! plus one standard Gumbel draw; the perturbed scores are sorted descending and the first
//! `top_k` kept. This samples `top_k` items without replacement from
//! `softmax(adjusted)` (Plackett-Luce), so:
//!
//! - low temperature → the order converges to plain descending score;
//! - high temperature → the order approaches uniform.
//!
//! The generator is `StdRng::seed_from_u64(slot_seed(..))` and candidates draw their noise
//! in id order, so the decision depends only on (candidate set, policy, slot, window).

use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gumbel};

use crate::decision::DecisionParts;
use crate::{
    slot_seed, validate_candidates, Candidate, DecisionEntry, PolicySnapshot, SeedStrategy,
    SelectionDecision, SelectionError,
};

/// Lower bound on the temperature used as a divisor.
pub const TEMPERATURE_FLOOR: f64 = 1e-3;

/// The subset of a policy the selection engine reads.
///
/// [`select`] derives this from a validated snapshot. Building one by hand skips policy
/// validation; it exists for replays, benches and exploring knob values outside the
/// deployable ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionParams {
    pub policy_version: String,
    pub policy_revision: u64,
    pub bias: f64,
    pub temperature: f64,
    pub top_k: usize,
    pub epsilon: f64,
    pub slot_duration_minutes: u32,
    pub global_seed: u64,
    pub seed_strategy: SeedStrategy,
}

impl From<&PolicySnapshot> for SelectionParams {
    fn from(p: &PolicySnapshot) -> Self {
        Self {
            policy_version: p.version().to_string(),
            policy_revision: p.revision(),
            bias: p.bias(),
            temperature: p.temperature(),
            top_k: p.top_k(),
            epsilon: p.epsilon(),
            slot_duration_minutes: p.slot_duration_minutes(),
            global_seed: p.global_seed(),
            seed_strategy: p.seed_strategy(),
        }
    }
}

impl SelectionParams {
    /// Seed for the slot containing `slot_time`.
    pub fn seed_for(&self, slot_time: DateTime<Utc>, window_id: &str) -> u64 {
        match self.seed_strategy {
            SeedStrategy::WindowSlot => slot_seed(
                self.global_seed,
                window_id,
                slot_start(slot_time, self.slot_duration_minutes),
            ),
            SeedStrategy::Fixed => self.global_seed,
        }
    }
}

/// Truncate `slot_time` to the start of its slot (slots are aligned to the Unix epoch).
pub fn slot_start(slot_time: DateTime<Utc>, slot_duration_minutes: u32) -> DateTime<Utc> {
    let len = i64::from(slot_duration_minutes.max(1)) * 60;
    let start = slot_time.timestamp().div_euclid(len) * len;
    Utc.timestamp_opt(start, 0).single().unwrap_or(slot_time)
}

/// Run one selection for `window_id` at `slot_time` under `policy`.
///
/// An empty candidate list yields an empty decision. Non-finite scores and duplicate ids
/// are rejected before anything is sorted.
pub fn select(
    candidates: &[Candidate],
    policy: &PolicySnapshot,
    slot_time: DateTime<Utc>,
    window_id: &str,
) -> Result<SelectionDecision, SelectionError> {
    select_with(candidates, &SelectionParams::from(policy), slot_time, window_id)
}

/// [`select`] with explicit parameters.
pub fn select_with(
    candidates: &[Candidate],
    params: &SelectionParams,
    slot_time: DateTime<Utc>,
    window_id: &str,
) -> Result<SelectionDecision, SelectionError> {
    validate_candidates(candidates)?;

    let start = slot_start(slot_time, params.slot_duration_minutes);
    let seed = params.seed_for(slot_time, window_id);
    let temperature = if params.temperature.is_finite() {
        params.temperature.max(TEMPERATURE_FLOOR)
    } else {
        1.0
    };

    // Draw order is fixed by id, not by input order.
    let mut pool: Vec<&Candidate> = candidates.iter().collect();
    pool.sort_by(|a, b| a.id.cmp(&b.id));

    let mut rng = StdRng::seed_from_u64(seed);
    let gumbel = Gumbel::new(0.0, 1.0).ok();
    let mut ranked: Vec<DecisionEntry> = Vec::with_capacity(pool.len());
    for c in pool {
        let noise = gumbel.as_ref().map_or(0.0, |g| g.sample(&mut rng));
        let perturbed = (c.score + params.bias) / temperature + noise;
        if !perturbed.is_finite() {
            return Err(SelectionError::PerturbedOverflow { id: c.id.clone() });
        }
        ranked.push(DecisionEntry {
            id: c.id.clone(),
            score: c.score,
            perturbed,
        });
    }

    ranked.sort_by(|a, b| {
        b.perturbed
            .total_cmp(&a.perturbed)
            .then_with(|| a.id.cmp(&b.id))
    });

    let n = ranked.len();
    let k = params.top_k.min(n);

    // Always consume the exploration draw so the stream does not depend on epsilon.
    let u: f64 = rng.gen();
    let mut explored = None;
    if k > 0 && n > k && u < params.epsilon {
        let j = rng.gen_range(k..n);
        ranked.swap(k - 1, j);
        explored = Some(ranked[k - 1].id.clone());
    }
    ranked.truncate(k);

    tracing::debug!(
        window_id,
        slot_start = %start,
        seed,
        temperature,
        candidates = n,
        chosen = k,
        explored = explored.as_deref().unwrap_or(""),
        "selection complete"
    );

    Ok(SelectionDecision::new(DecisionParts {
        policy_version: params.policy_version.clone(),
        policy_revision: params.policy_revision,
        window_id: window_id.to_string(),
        slot_start: start,
        decided_at: slot_time,
        seed,
        temperature,
        entries: ranked,
        explored,
    }))
}
