//! Deadline, breaker and cancellation behaviour of the advisory client, on paused time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use slotmux::{
    select, Advisor, AdvisoryClient, AdvisoryError, AdvisoryRequest, AdvisoryResponse,
    AdvisoryStatus, BreakerState, Candidate, PolicyDocument, PolicySnapshot, SelectionDecision,
};

const SAMPLE: &str = include_str!("../config/business_logic.yaml");

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap()
}

fn policy() -> PolicySnapshot {
    let mut doc = PolicyDocument::from_yaml(SAMPLE).unwrap();
    doc.llm_integration.enabled = true;
    PolicySnapshot::new(doc, 1, t0()).unwrap()
}

fn base(policy: &PolicySnapshot, window: &str) -> SelectionDecision {
    let cands: Vec<Candidate> = (0..12)
        .map(|i| Candidate::new(format!("c{i:02}"), 1.0 - i as f64 * 0.05))
        .collect();
    select(&cands, policy, t0(), window).unwrap()
}

/// Hangs for ten seconds while `slow` is set, otherwise answers with the reversed order.
struct Flaky {
    slow: AtomicBool,
    calls: AtomicUsize,
}

impl Flaky {
    fn new(slow: bool) -> Arc<Self> {
        Arc::new(Self {
            slow: AtomicBool::new(slow),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Advisor for Flaky {
    async fn rerank(&self, req: AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(StdDuration::from_secs(10)).await;
        }
        Ok(AdvisoryResponse {
            order: req.entries.iter().rev().map(|e| e.id.clone()).collect(),
            confidence: 0.95,
            source: "flaky".to_string(),
            cost_eur: Some(0.005),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn three_deadline_overruns_open_the_breaker() {
    let policy = policy();
    let advisor = Flaky::new(true);
    let client = AdvisoryClient::new(advisor.clone(), policy.advisory());

    for w in 0..3 {
        let d = base(&policy, &format!("w{w}"));
        let before: Vec<String> = d.ids().iter().map(|s| s.to_string()).collect();
        let out = client
            .maybe_rerank(d, serde_json::Value::Null, &policy, t0())
            .await;
        let note = out.advisory().unwrap();
        assert_eq!(note.status, AdvisoryStatus::TimedOut);
        assert_eq!(out.ids(), before, "timeout keeps the base order");
    }
    assert_eq!(client.breaker_state(), BreakerState::Open);

    // Within the recovery window: skipped, not attempted.
    let d = base(&policy, "w3");
    let before: Vec<String> = d.ids().iter().map(|s| s.to_string()).collect();
    let out = client
        .maybe_rerank(d, serde_json::Value::Null, &policy, t0() + Duration::seconds(30))
        .await;
    let note = out.advisory().unwrap();
    assert_eq!(note.status, AdvisoryStatus::CircuitOpen);
    assert!(!note.applied);
    assert_eq!(out.ids(), before);
    assert_eq!(advisor.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn half_open_trial_closes_the_breaker_on_success() {
    let policy = policy();
    let advisor = Flaky::new(true);
    let client = AdvisoryClient::new(advisor.clone(), policy.advisory());
    for w in 0..3 {
        let d = base(&policy, &format!("w{w}"));
        let _ = client
            .maybe_rerank(d, serde_json::Value::Null, &policy, t0())
            .await;
    }
    assert_eq!(client.breaker_state(), BreakerState::Open);

    advisor.slow.store(false, Ordering::SeqCst);
    let trial_at = t0() + Duration::minutes(5);
    let out = client
        .maybe_rerank(base(&policy, "trial"), serde_json::Value::Null, &policy, trial_at)
        .await;
    let note = out.advisory().unwrap();
    assert_eq!(note.status, AdvisoryStatus::Applied);
    assert_eq!(note.breaker, BreakerState::Closed);
    assert_eq!(client.breaker_state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn cancelled_attempt_counts_as_one_failure() {
    let policy = policy();
    let client = AdvisoryClient::new(Flaky::new(true), policy.advisory());

    let call = client.maybe_rerank(base(&policy, "w"), serde_json::Value::Null, &policy, t0());
    // The caller gives up before the client's own deadline.
    let outer = tokio::time::timeout(StdDuration::from_secs(1), call).await;
    assert!(outer.is_err());

    let snap = client.breaker_snapshot();
    assert_eq!(snap.attempts, 1);
    assert_eq!(snap.failures, 1);
    assert_eq!(snap.state, BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn reported_cost_is_settled_against_the_budget() {
    let policy = policy();
    let client = AdvisoryClient::new(Flaky::new(false), policy.advisory());
    let out = client
        .maybe_rerank(base(&policy, "w"), serde_json::Value::Null, &policy, t0())
        .await;
    assert!(out.advisory().unwrap().applied);
    // Estimate 0.01 replaced by the reported 0.005.
    assert!((client.remaining_budget(t0()) - 0.995).abs() < 1e-9);
}
