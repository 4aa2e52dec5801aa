//! Statistical and property tests for seeded Gumbel-Top-k selection.

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use slotmux::{
    select, select_with, Candidate, PolicyDocument, PolicySnapshot, SeedStrategy,
    SelectionParams, TEMPERATURE_FLOOR,
};

const SAMPLE: &str = include_str!("../config/business_logic.yaml");

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap()
}

fn policy() -> PolicySnapshot {
    PolicySnapshot::new(PolicyDocument::from_yaml(SAMPLE).unwrap(), 1, t0()).unwrap()
}

fn params(temperature: f64, top_k: usize) -> SelectionParams {
    SelectionParams {
        policy_version: "2025.03".to_string(),
        policy_revision: 0,
        bias: 0.0,
        temperature,
        top_k,
        epsilon: 0.0,
        slot_duration_minutes: 30,
        global_seed: 4242,
        seed_strategy: SeedStrategy::WindowSlot,
    }
}

fn abc() -> Vec<Candidate> {
    vec![
        Candidate::new("a", 0.9),
        Candidate::new("b", 0.85),
        Candidate::new("c", 0.5),
    ]
}

fn ladder(n: usize) -> Vec<Candidate> {
    (0..n)
        .map(|i| Candidate::new(format!("c{i:02}"), 1.0 - i as f64 * 0.05))
        .collect()
}

// ---------------------------------------------------------------------------
// Low-temperature ranking
// ---------------------------------------------------------------------------

#[test]
fn low_temperature_approximates_plain_ranking() {
    let d = select_with(&abc(), &params(TEMPERATURE_FLOOR, 2), t0(), "main").unwrap();
    assert_eq!(d.ids(), vec!["a", "b"]);

    // At temperature 0.1 the Plackett-Luce probability of exactly [a, b] is ~0.60 and of
    // the set {a, b} ~0.96.
    let p = params(0.1, 2);
    let (mut exact, mut set) = (0, 0);
    for w in 0..1000 {
        let d = select_with(&abc(), &p, t0(), &format!("window-{w}")).unwrap();
        let ids = d.ids();
        if ids == ["a", "b"] {
            exact += 1;
        }
        if ids.contains(&"a") && ids.contains(&"b") {
            set += 1;
        }
    }
    assert!(exact > 500, "exact={exact}");
    assert!(set >= 930, "set={set}");
}

#[test]
fn low_temperature_window_outcomes_are_pinned() {
    // Replay fixtures: a given window and slot always yields the same draw, even when it is
    // not the most likely order.
    let p = params(0.1, 2);
    let main = select_with(&abc(), &p, t0(), "main").unwrap();
    assert_eq!(main.ids(), vec!["b", "a"]);
    let w0 = select_with(&abc(), &p, t0(), "window-0").unwrap();
    assert_eq!(w0.ids(), vec!["a", "b"]);
    for d in [&main, &w0] {
        let mut ids = d.ids();
        ids.sort_unstable();
        assert_eq!(ids, vec!["a", "b"]);
    }
}

// ---------------------------------------------------------------------------
// Determinism and seed sensitivity
// ---------------------------------------------------------------------------

#[test]
fn decisions_replay_byte_for_byte() {
    let policy = policy();
    let cands = ladder(20);
    let a = select(&cands, &policy, t0(), "main").unwrap();
    let b = select(&cands, &policy, t0() + Duration::minutes(7), "main").unwrap();
    assert_eq!(a.ids(), b.ids(), "same slot, same order");
    assert_eq!(a.seed(), b.seed());
    let again = select(&cands, &policy, t0(), "main").unwrap();
    assert_eq!(
        serde_json::to_vec(&a).unwrap(),
        serde_json::to_vec(&again).unwrap()
    );
}

#[test]
fn different_windows_and_slots_see_different_noise() {
    let p = params(1.0, 10);
    let cands = ladder(20);
    let base = select_with(&cands, &p, t0(), "main").unwrap();

    let other_windows = (0..20)
        .filter(|w| {
            let d = select_with(&cands, &p, t0(), &format!("w{w}")).unwrap();
            d.ids() != base.ids()
        })
        .count();
    assert!(other_windows >= 15, "{other_windows}");

    let next_slot = select_with(&cands, &p, t0() + Duration::minutes(30), "main").unwrap();
    assert_ne!(next_slot.seed(), base.seed());
}

// ---------------------------------------------------------------------------
// Temperature monotonicity
// ---------------------------------------------------------------------------

fn best_first_rate(temperature: f64, trials: usize) -> usize {
    let cands: Vec<Candidate> = [0.9, 0.7, 0.5, 0.3, 0.1]
        .iter()
        .enumerate()
        .map(|(i, s)| Candidate::new(format!("k{i}"), *s))
        .collect();
    let p = params(temperature, 1);
    (0..trials)
        .filter(|w| select_with(&cands, &p, t0(), &format!("t{w}")).unwrap().ids() == ["k0"])
        .count()
}

#[test]
fn lower_temperature_concentrates_on_the_best_candidate() {
    // Expected rates: ~0.87 at T=0.1, ~0.24 at T=2.0.
    let cold = best_first_rate(0.1, 500);
    let hot = best_first_rate(2.0, 500);
    assert!(cold > 380, "cold={cold}");
    assert!(hot < 180, "hot={hot}");
    assert!(cold > hot + 150);
}

// ---------------------------------------------------------------------------
// Property tests
// ---------------------------------------------------------------------------

proptest! {
    /// Under any valid policy, the decision is a duplicate-free prefix-sized subset of the
    /// input, sorted by perturbed score.
    #[test]
    fn policy_selection_shape(
        n in 0usize..60,
        top_k in 5usize..=50,
        temperature in 0.1f64..=2.0,
        bias in -0.2f64..=0.2,
        minute in 0i64..10_000,
    ) {
        let mut doc = PolicyDocument::from_yaml(SAMPLE).unwrap();
        doc.selection.top_k = top_k;
        doc.selection.temperature = temperature;
        doc.knobs.plan_selection_bias = bias;
        let policy = PolicySnapshot::new(doc, 1, t0()).unwrap();

        let cands = ladder(n);
        let d = select(&cands, &policy, t0() + Duration::minutes(minute), "main").unwrap();
        prop_assert_eq!(d.len(), top_k.min(n));
        for e in d.entries() {
            prop_assert!(cands.iter().any(|c| c.id == e.id));
        }
        let mut ids = d.ids();
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(ids.len(), d.len());
        if d.explored().is_none() {
            for w in d.entries().windows(2) {
                prop_assert!(w[0].perturbed >= w[1].perturbed);
            }
        }
    }
}
