//! Shared fixtures for unit tests.

use chrono::{DateTime, TimeZone, Utc};

use crate::{Candidate, PolicyDocument, PolicySnapshot};

pub(crate) const POLICY_YAML: &str = r#"
policy_version: "2025.03"
env: staging
knobs:
  boost_bucket: evening
  music_mood_focus: [calm]
  interstitials_ratio: 0.1
  plan_selection_bias: 0.0
scheduling:
  slot_duration_minutes: 30
  global_seed: 4242
selection:
  method: gumbel_top_k
  temperature: 0.7
  top_k: 5
  seed_strategy: window_slot
exploration:
  epsilon: 0.0
kpis:
  primary: [retention]
  secondary: [diversity]
autopilot:
  enabled: true
  max_daily_variation: 0.05
llm_integration:
  enabled: true
  max_budget_eur_per_hour: 1.0
  cost_per_call_eur: 0.01
  confidence_threshold: 0.7
  circuit_breaker:
    failure_threshold: 0.2
    window_size: 50
    min_calls: 3
    timeout_seconds: 3.0
    recovery_timeout_seconds: 60
curator_vigilante:
  enabled: true
  confidence_threshold: 0.6
  max_displacement: 4
  token_bucket:
    capacity: 2
    refill_rate_per_hour: 1
"#;

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap()
}

pub(crate) fn document() -> PolicyDocument {
    PolicyDocument::from_yaml(POLICY_YAML).unwrap()
}

pub(crate) fn snapshot_with(f: impl FnOnce(&mut PolicyDocument)) -> PolicySnapshot {
    let mut doc = document();
    f(&mut doc);
    PolicySnapshot::new(doc, 1, t0()).unwrap()
}

pub(crate) fn snapshot() -> PolicySnapshot {
    snapshot_with(|_| {})
}

/// Ten candidates with distinct kinds, tags and durations.
pub(crate) fn varied_candidates() -> Vec<Candidate> {
    let kinds = ["music", "talk", "news", "jingle", "ad"];
    (0..10)
        .map(|i| {
            Candidate::new(format!("c{i}"), 1.0 - i as f64 * 0.08)
                .with_kind(kinds[i % kinds.len()])
                .with_tags([format!("tag{i}")])
                .with_duration(60 + 150 * i as u32)
        })
        .collect()
}
