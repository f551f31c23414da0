use super::{parse_ts, ts, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{FeedbackAction, HumanFeedback};
use chrono::Utc;
use rusqlite::params;

impl HumanFeedback {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let action: String = row.get(3)?;
        let original_json: Option<String> = row.get(4)?;
        let corrected_json: Option<String> = row.get(5)?;
        let created_at: String = row.get(8)?;
        Ok(HumanFeedback {
            id: row.get(0)?,
            target_type: row.get(1)?,
            target_id: row.get(2)?,
            action: FeedbackAction::parse(&action).unwrap_or(FeedbackAction::Pin),
            original_value: original_json.and_then(|json| serde_json::from_str(&json).ok()),
            corrected_value: corrected_json.and_then(|json| serde_json::from_str(&json).ok()),
            notes: row.get(6)?,
            created_by: row.get(7)?,
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        })
    }
}

const FEEDBACK_COLUMNS: &str = "id, target_type, target_id, action, original_value_json, \
     corrected_value_json, notes, created_by, created_at";

impl Store {
    pub fn insert_feedback(&self, feedback: &HumanFeedback) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO human_feedback (id, target_type, target_id, action,
                                         original_value_json, corrected_value_json,
                                         notes, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                feedback.id,
                feedback.target_type,
                feedback.target_id,
                feedback.action.as_str(),
                feedback
                    .original_value
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                feedback
                    .corrected_value
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                feedback.notes,
                feedback.created_by,
                ts(feedback.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_feedback(
        &self,
        target_type: Option<&str>,
        action: Option<FeedbackAction>,
        limit: usize,
    ) -> EngineResult<Vec<HumanFeedback>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FEEDBACK_COLUMNS} FROM human_feedback
             WHERE (?1 IS NULL OR target_type = ?1)
               AND (?2 IS NULL OR action = ?2)
             ORDER BY created_at DESC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![target_type, action.map(|a| a.as_str()), limit as i64],
                HumanFeedback::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Latest suppressive feedback action (mark_noise / invalidate) for an
    /// event, if any. The clusterer consults this before merging.
    pub fn latest_event_suppression(
        &self,
        event_id: &str,
    ) -> EngineResult<Option<FeedbackAction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT action FROM human_feedback
             WHERE target_type = 'event' AND target_id = ?1
               AND action IN ('mark_noise', 'invalidate')
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![event_id], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(FeedbackAction::parse(&row?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn feedback(target_id: &str, action: FeedbackAction) -> HumanFeedback {
        HumanFeedback {
            id: Uuid::new_v4().to_string(),
            target_type: "event".into(),
            target_id: target_id.to_string(),
            action,
            original_value: None,
            corrected_value: None,
            notes: None,
            created_by: Some("analyst@horadus".into()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn latest_suppressive_action_wins() {
        let store = Store::open_in_memory().unwrap();
        let event_id = Uuid::new_v4().to_string();

        assert!(store.latest_event_suppression(&event_id).unwrap().is_none());

        let mut first = feedback(&event_id, FeedbackAction::MarkNoise);
        first.created_at = Utc::now() - chrono::Duration::minutes(5);
        store.insert_feedback(&first).unwrap();
        // Pin is not suppressive and must not mask the earlier mark_noise.
        store.insert_feedback(&feedback(&event_id, FeedbackAction::Pin)).unwrap();

        assert_eq!(
            store.latest_event_suppression(&event_id).unwrap(),
            Some(FeedbackAction::MarkNoise)
        );

        store
            .insert_feedback(&feedback(&event_id, FeedbackAction::Invalidate))
            .unwrap();
        assert_eq!(
            store.latest_event_suppression(&event_id).unwrap(),
            Some(FeedbackAction::Invalidate)
        );
    }

    #[test]
    fn list_feedback_filters() {
        let store = Store::open_in_memory().unwrap();
        let event_id = Uuid::new_v4().to_string();
        store.insert_feedback(&feedback(&event_id, FeedbackAction::Pin)).unwrap();
        store
            .insert_feedback(&feedback(&event_id, FeedbackAction::MarkNoise))
            .unwrap();

        let all = store.list_feedback(Some("event"), None, 10).unwrap();
        assert_eq!(all.len(), 2);
        let noise = store
            .list_feedback(Some("event"), Some(FeedbackAction::MarkNoise), 10)
            .unwrap();
        assert_eq!(noise.len(), 1);
        assert_eq!(noise[0].action, FeedbackAction::MarkNoise);
    }
}
