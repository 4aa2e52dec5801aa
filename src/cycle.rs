//! One selection cycle per slot: snapshot, select, advise, review, audit.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::{
    select, slot_start, Advisor, AdvisoryClient, AuditRecord, AuditSink, Candidate, ConfigStore,
    CycleError, InterventionMonitor, SelectionDecision, SelectionError, WindowContext,
};

type SlotKey = (String, i64);

/// Marks a slot as in flight until dropped.
struct SlotGuard {
    in_flight: Arc<Mutex<BTreeSet<SlotKey>>>,
    key: SlotKey,
}

impl SlotGuard {
    fn acquire(
        in_flight: &Arc<Mutex<BTreeSet<SlotKey>>>,
        window_id: &str,
        slot_start: i64,
    ) -> Result<Self, CycleError> {
        let key = (window_id.to_string(), slot_start);
        let mut set = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.clone()) {
            return Err(CycleError::SlotInFlight {
                window_id: key.0,
                slot_start,
            });
        }
        Ok(Self {
            in_flight: Arc::clone(in_flight),
            key,
        })
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Wires the stages together. Not re-entrant per `(window, slot)`.
pub struct SlotPipeline {
    store: Arc<ConfigStore>,
    advisory: Option<AdvisoryClient>,
    monitor: InterventionMonitor,
    audit: Option<Arc<dyn AuditSink>>,
    in_flight: Arc<Mutex<BTreeSet<SlotKey>>>,
}

impl SlotPipeline {
    pub fn new(store: Arc<ConfigStore>, now: DateTime<Utc>) -> Self {
        let monitor = InterventionMonitor::new(store.snapshot().curator(), now);
        Self {
            store,
            advisory: None,
            monitor,
            audit: None,
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn Advisor>) -> Self {
        let policy = self.store.snapshot();
        self.advisory = Some(AdvisoryClient::new(advisor, policy.advisory()));
        self
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn advisory(&self) -> Option<&AdvisoryClient> {
        self.advisory.as_ref()
    }

    pub fn monitor(&self) -> &InterventionMonitor {
        &self.monitor
    }

    /// Selection only, against the active policy. Touches no breaker, budget, bucket or
    /// audit sink.
    pub fn preview(
        &self,
        candidates: &[Candidate],
        slot_time: DateTime<Utc>,
        window_id: &str,
    ) -> Result<SelectionDecision, SelectionError> {
        select(candidates, &self.store.snapshot(), slot_time, window_id)
    }

    /// Run the full cycle for `window_id` at `slot_time`.
    ///
    /// `now` drives the breaker, budget and token bucket clocks; the decision itself only
    /// depends on `slot_time`.
    pub async fn run(
        &self,
        candidates: &[Candidate],
        slot_time: DateTime<Utc>,
        window_id: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<SelectionDecision, CycleError> {
        let policy = self.store.snapshot();
        let start = slot_start(slot_time, policy.slot_duration_minutes());
        let _slot = SlotGuard::acquire(&self.in_flight, window_id, start.timestamp())?;

        let decision = select(candidates, &policy, slot_time, window_id)?;
        let decision = match &self.advisory {
            Some(client) => client.maybe_rerank(decision, payload, &policy, now).await,
            None => decision,
        };
        let ctx = WindowContext::new(candidates, now);
        let decision = self.monitor.review(decision, &ctx, &policy);

        if let Some(sink) = &self.audit {
            sink.append(&AuditRecord::from_decision(&decision, &policy)?)?;
        }
        tracing::info!(
            window_id,
            slot_start = %decision.slot_start(),
            revision = policy.revision(),
            chosen = decision.len(),
            advisory = ?decision.advisory().map(|a| a.status),
            intervention = ?decision.intervention().map(|i| i.status),
            "slot decided"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{document, t0, varied_candidates};
    use crate::MemoryAuditLog;

    fn pipeline() -> (SlotPipeline, Arc<MemoryAuditLog>) {
        let store = Arc::new(ConfigStore::from_document(document(), t0()).unwrap());
        let log = Arc::new(MemoryAuditLog::new());
        let p = SlotPipeline::new(store, t0()).with_audit(log.clone());
        (p, log)
    }

    #[tokio::test]
    async fn cycle_for_busy_slot_fails_fast() {
        let (p, log) = pipeline();
        let start = slot_start(t0(), 30).timestamp();
        let held = SlotGuard::acquire(&p.in_flight, "main", start).unwrap();

        let err = p
            .run(&varied_candidates(), t0(), "main", serde_json::Value::Null, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::SlotInFlight { .. }));
        // Other windows are independent.
        p.run(&varied_candidates(), t0(), "other", serde_json::Value::Null, t0())
            .await
            .unwrap();

        drop(held);
        p.run(&varied_candidates(), t0(), "main", serde_json::Value::Null, t0())
            .await
            .unwrap();
        assert_eq!(log.records().len(), 2);
    }

    #[tokio::test]
    async fn non_finite_score_aborts_without_audit() {
        let (p, log) = pipeline();
        let mut cands = varied_candidates();
        cands[3].score = f64::NAN;
        let err = p
            .run(&cands, t0(), "main", serde_json::Value::Null, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Selection(SelectionError::NonFiniteScore { .. })));
        assert!(log.records().is_empty());
        // The slot is released on error.
        assert!(p.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn huge_finite_score_aborts_without_audit() {
        let (p, log) = pipeline();
        let mut cands = varied_candidates();
        cands[0].score = 1e308;
        let err = p
            .run(&cands, t0(), "main", serde_json::Value::Null, t0())
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Selection(SelectionError::ScoreOutOfRange { .. })));
        assert!(log.records().is_empty());
    }

    #[tokio::test]
    async fn preview_matches_cycle_base_order_without_side_effects() {
        let (p, log) = pipeline();
        let preview = p.preview(&varied_candidates(), t0(), "main").unwrap();
        assert!(log.records().is_empty());
        let full = p
            .run(&varied_candidates(), t0(), "main", serde_json::Value::Null, t0())
            .await
            .unwrap();
        // No advisor and a low-confidence curator leave the base order untouched.
        assert_eq!(preview.ids(), full.ids());
        assert!(log.records()[0].verify());
    }
}
