use super::{parse_ts, ts, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{Trend, TrendIndicator};
use chrono::Utc;
use rusqlite::params;
use std::collections::BTreeMap;

impl Trend {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let definition_json: String = row.get(3)?;
        let indicators_json: String = row.get(4)?;
        let updated_at: String = row.get(9)?;
        let indicators: BTreeMap<String, TrendIndicator> =
            serde_json::from_str(&indicators_json).unwrap_or_default();
        Ok(Trend {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            definition: serde_json::from_str(&definition_json)
                .unwrap_or(serde_json::Value::Null),
            indicators,
            baseline_log_odds: row.get(5)?,
            current_log_odds: row.get(6)?,
            decay_half_life_days: row.get(7)?,
            is_active: row.get::<_, i64>(8)? != 0,
            updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
        })
    }
}

pub(crate) const TREND_COLUMNS: &str = "id, name, description, definition_json, indicators_json, \
     baseline_log_odds, current_log_odds, decay_half_life_days, is_active, updated_at";

impl Store {
    pub fn insert_trend(&self, trend: &Trend) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trends (id, name, description, definition_json, indicators_json,
                                 baseline_log_odds, current_log_odds, decay_half_life_days,
                                 is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trend.id,
                trend.name,
                trend.description,
                serde_json::to_string(&trend.definition)?,
                serde_json::to_string(&trend.indicators)?,
                trend.baseline_log_odds,
                trend.current_log_odds,
                trend.decay_half_life_days,
                trend.is_active as i64,
                ts(Utc::now()),
                ts(trend.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_trend(&self, id: &str) -> EngineResult<Option<Trend>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TREND_COLUMNS} FROM trends WHERE id = ?1 LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![id], Trend::from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn list_active_trends(&self) -> EngineResult<Vec<Trend>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TREND_COLUMNS} FROM trends WHERE is_active = 1 ORDER BY name ASC"
        ))?;
        let trends = stmt
            .query_map([], Trend::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trends)
    }

    pub fn set_trend_active(&self, id: &str, is_active: bool) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trends SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, is_active as i64, ts(Utc::now())],
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::atoms::types::Direction;
    use uuid::Uuid;

    pub fn sample_trend(identifier: &str) -> Trend {
        let mut indicators = BTreeMap::new();
        indicators.insert(
            "military_movement".to_string(),
            TrendIndicator {
                weight: 0.04,
                direction: Direction::Escalatory,
                decay_half_life_days: None,
                keywords: vec!["troops".into(), "buildup".into()],
            },
        );
        indicators.insert(
            "diplomatic_talks".to_string(),
            TrendIndicator {
                weight: 0.03,
                direction: Direction::DeEscalatory,
                decay_half_life_days: Some(14),
                keywords: vec!["summit".into(), "negotiations".into()],
            },
        );
        Trend {
            id: Uuid::new_v4().to_string(),
            name: format!("Trend {identifier}"),
            description: None,
            definition: serde_json::json!({ "id": identifier }),
            indicators,
            baseline_log_odds: -2.0,
            current_log_odds: -2.0,
            decay_half_life_days: 30,
            is_active: true,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::sample_trend;
    use super::*;

    #[test]
    fn trend_round_trip_keeps_indicators() {
        let store = Store::open_in_memory().unwrap();
        let trend = sample_trend("eu-russia");
        store.insert_trend(&trend).unwrap();

        let loaded = store.get_trend(&trend.id).unwrap().unwrap();
        assert_eq!(loaded.identifier(), "eu-russia");
        assert_eq!(loaded.indicators.len(), 2);
        let indicator = &loaded.indicators["diplomatic_talks"];
        assert_eq!(indicator.decay_half_life_days, Some(14));
        assert_eq!(indicator.keywords, vec!["summit".to_string(), "negotiations".to_string()]);
    }

    #[test]
    fn only_active_trends_are_listed() {
        let store = Store::open_in_memory().unwrap();
        let active = sample_trend("active");
        let mut inactive = sample_trend("inactive");
        inactive.is_active = false;
        store.insert_trend(&active).unwrap();
        store.insert_trend(&inactive).unwrap();

        let trends = store.list_active_trends().unwrap();
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].id, active.id);

        store.set_trend_active(&active.id, false).unwrap();
        assert!(store.list_active_trends().unwrap().is_empty());
    }
}
