// Horadus — Feedback Application
//
// Applies analyst feedback to events with its declared effects:
//   pin            — annotation only
//   mark_noise     — archive the event (suppresses future merges)
//   invalidate     — reverse the event's evidence contributions, then
//                    suppress like mark_noise
// Trend overrides (override_delta) live on the trend engine, which owns
// the log-odds mutation.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{EventLifecycle, FeedbackAction, HumanFeedback};
use crate::engine::store::Store;
use crate::engine::trend::TrendEngine;
use chrono::Utc;
use log::info;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub struct FeedbackService {
    store: Arc<Store>,
    trend_engine: TrendEngine,
}

impl FeedbackService {
    pub fn new(store: Arc<Store>) -> Self {
        let trend_engine = TrendEngine::new(Arc::clone(&store));
        FeedbackService { store, trend_engine }
    }

    /// Record event feedback and apply its effect.
    pub fn apply_event_feedback(
        &self,
        event_id: &str,
        action: FeedbackAction,
        notes: Option<&str>,
        created_by: Option<&str>,
    ) -> EngineResult<HumanFeedback> {
        let event = self
            .store
            .get_event(event_id)?
            .ok_or_else(|| EngineError::not_found(format!("event '{event_id}'")))?;

        let feedback_id = Uuid::new_v4().to_string();
        let (original_value, corrected_value) = match action {
            FeedbackAction::Pin => (None, None),
            FeedbackAction::MarkNoise => {
                let original = json!({ "lifecycle_status": event.lifecycle_status.as_str() });
                self.store
                    .set_event_lifecycle(event_id, EventLifecycle::Archived)?;
                (
                    Some(original),
                    Some(json!({ "lifecycle_status": EventLifecycle::Archived.as_str() })),
                )
            }
            FeedbackAction::Invalidate => {
                let reverted = self
                    .trend_engine
                    .invalidate_event_evidence(event_id, &feedback_id)?;
                let original = json!({
                    "trend_deltas": reverted,
                    "affected_trend_count": reverted.len(),
                });
                (
                    Some(original),
                    Some(json!({ "reverted_event_id": event_id })),
                )
            }
            FeedbackAction::OverrideDelta => {
                return Err(EngineError::validation(
                    "override_delta targets trends, not events",
                ));
            }
        };

        let feedback = HumanFeedback {
            id: feedback_id,
            target_type: "event".into(),
            target_id: event_id.to_string(),
            action,
            original_value,
            corrected_value,
            notes: notes.map(str::to_string),
            created_by: created_by.map(str::to_string),
            created_at: Utc::now(),
        };
        self.store.insert_feedback(&feedback)?;
        info!(
            "[feedback] Applied {} to event {}",
            action.as_str(),
            event_id
        );
        Ok(feedback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{seed_event, seed_trend};
    use crate::engine::trend::EvidenceFactors;

    fn factors(delta: f64) -> EvidenceFactors {
        EvidenceFactors {
            base_weight: 0.04,
            severity: 0.8,
            confidence: 0.9,
            credibility: 0.9,
            corroboration: 0.6,
            novelty: 1.0,
            evidence_age_days: 0.0,
            temporal_decay: 1.0,
            direction_multiplier: 1.0,
            raw_delta: delta,
            clamped_delta: delta,
        }
    }

    #[test]
    fn mark_noise_archives_and_suppresses() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let event = seed_event(&store, "noise candidate");
        let service = FeedbackService::new(Arc::clone(&store));

        let feedback = service
            .apply_event_feedback(
                &event.id,
                FeedbackAction::MarkNoise,
                Some("duplicate chatter"),
                Some("analyst@horadus"),
            )
            .unwrap();
        assert_eq!(feedback.action, FeedbackAction::MarkNoise);

        let archived = store.get_event(&event.id).unwrap().unwrap();
        assert_eq!(archived.lifecycle_status, EventLifecycle::Archived);
        assert_eq!(
            store.latest_event_suppression(&event.id).unwrap(),
            Some(FeedbackAction::MarkNoise)
        );
    }

    #[test]
    fn invalidate_reverses_evidence_sum_for_each_trend() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let trend = seed_trend(&store, "invalidate-feedback");
        let event = seed_event(&store, "invalidated event");
        let engine = TrendEngine::new(Arc::clone(&store));
        engine
            .apply_evidence(&trend.id, &event.id, "signal_primary", &factors(0.2), None)
            .unwrap();
        engine
            .apply_evidence(&trend.id, &event.id, "signal_secondary", &factors(0.1), None)
            .unwrap();

        let service = FeedbackService::new(Arc::clone(&store));
        let feedback = service
            .apply_event_feedback(&event.id, FeedbackAction::Invalidate, None, None)
            .unwrap();

        // Trend restored to its pre-evidence value; evidence rows linked to
        // this feedback.
        let after = store.get_trend(&trend.id).unwrap().unwrap();
        assert!((after.current_log_odds - trend.current_log_odds).abs() < 1e-9);
        let evidence = store.list_event_evidence(&event.id).unwrap();
        assert!(evidence
            .iter()
            .all(|row| row.invalidation_feedback_id.as_deref() == Some(feedback.id.as_str())));
        // Sum of still-live deltas for this pairing is zero.
        assert_eq!(store.count_prior_evidence(&trend.id, &event.id).unwrap(), 0);
    }

    #[test]
    fn override_delta_is_rejected_for_events() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let event = seed_event(&store, "target");
        let service = FeedbackService::new(store);
        assert!(service
            .apply_event_feedback(&event.id, FeedbackAction::OverrideDelta, None, None)
            .is_err());
    }
}
