// Horadus — Event Lifecycle
//
// State machine: EMERGING → CONFIRMED → FADING → ARCHIVED.
// Confirmation needs three distinct sources; faded/archived events revive
// to CONFIRMED on a new mention; the periodic decay check ages events that
// stop being mentioned.

use crate::atoms::constants::CONFIRMATION_THRESHOLD;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{Event, EventLifecycle};
use crate::engine::store::Store;
use chrono::{DateTime, Utc};

/// Apply a mention to an event in memory: refresh last_mention_at and run
/// the lifecycle transition. Returns true when the status changed.
pub fn on_event_mention(event: &mut Event, mentioned_at: DateTime<Utc>) -> bool {
    let previous = event.lifecycle_status;
    event.last_mention_at = mentioned_at;

    match event.lifecycle_status {
        EventLifecycle::Emerging => {
            if event.unique_source_count >= CONFIRMATION_THRESHOLD {
                event.lifecycle_status = EventLifecycle::Confirmed;
                event.confirmed_at = event.confirmed_at.or(Some(mentioned_at));
            }
        }
        EventLifecycle::Fading | EventLifecycle::Archived => {
            event.lifecycle_status = EventLifecycle::Confirmed;
            event.confirmed_at = event.confirmed_at.or(Some(mentioned_at));
        }
        EventLifecycle::Confirmed => {}
    }

    previous != event.lifecycle_status
}

/// Summary of one periodic decay pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LifecycleDecaySummary {
    pub as_of: DateTime<Utc>,
    pub confirmed_to_fading: usize,
    pub fading_to_archived: usize,
}

/// Run the recency-based lifecycle decay over all events.
pub fn run_decay_check(store: &Store, now: DateTime<Utc>) -> EngineResult<LifecycleDecaySummary> {
    let (confirmed_to_fading, fading_to_archived) = store.run_event_lifecycle_decay(now)?;
    Ok(LifecycleDecaySummary {
        as_of: now,
        confirmed_to_fading,
        fading_to_archived,
    })
}
