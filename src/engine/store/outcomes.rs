use super::{parse_ts, ts, Store};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{OutcomeType, RiskLevel, TrendOutcome};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl TrendOutcome {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let prediction_date: String = row.get(2)?;
        let risk: String = row.get(4)?;
        let outcome: String = row.get(7)?;
        let evidence_json: Option<String> = row.get(9)?;
        Ok(TrendOutcome {
            id: row.get(0)?,
            trend_id: row.get(1)?,
            prediction_date: parse_ts(&prediction_date).unwrap_or_else(Utc::now),
            predicted_probability: row.get(3)?,
            predicted_risk_level: parse_risk(&risk),
            probability_band_low: row.get(5)?,
            probability_band_high: row.get(6)?,
            outcome: OutcomeType::parse(&outcome).unwrap_or(OutcomeType::Ongoing),
            outcome_notes: row.get(8)?,
            outcome_evidence: evidence_json.and_then(|json| serde_json::from_str(&json).ok()),
            brier_score: row.get(10)?,
            recorded_by: row.get(11)?,
        })
    }
}

fn parse_risk(value: &str) -> RiskLevel {
    match value {
        "low" => RiskLevel::Low,
        "guarded" => RiskLevel::Guarded,
        "elevated" => RiskLevel::Elevated,
        "high" => RiskLevel::High,
        _ => RiskLevel::Severe,
    }
}

const OUTCOME_COLUMNS: &str = "id, trend_id, prediction_date, predicted_probability, \
     predicted_risk_level, probability_band_low, probability_band_high, outcome, \
     outcome_notes, outcome_evidence_json, brier_score, recorded_by";

impl Store {
    pub fn insert_outcome(&self, outcome: &TrendOutcome) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO trend_outcomes (id, trend_id, prediction_date, predicted_probability,
                                         predicted_risk_level, probability_band_low,
                                         probability_band_high, outcome, outcome_notes,
                                         outcome_evidence_json, brier_score, recorded_by,
                                         created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                outcome.id,
                outcome.trend_id,
                ts(outcome.prediction_date),
                outcome.predicted_probability,
                outcome.predicted_risk_level.as_str(),
                outcome.probability_band_low,
                outcome.probability_band_high,
                outcome.outcome.as_str(),
                outcome.outcome_notes,
                outcome
                    .outcome_evidence
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                outcome.brier_score,
                outcome.recorded_by,
                ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Outcomes for one trend, ascending by prediction date, optionally
    /// bounded by an inclusive date range.
    pub fn list_outcomes(
        &self,
        trend_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<TrendOutcome>> {
        let conn = self.conn.lock();
        let start_key = start.map(ts).unwrap_or_else(|| "0000".to_string());
        let end_key = end.map(ts).unwrap_or_else(|| "9999".to_string());
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTCOME_COLUMNS} FROM trend_outcomes
             WHERE trend_id = ?1 AND prediction_date >= ?2 AND prediction_date <= ?3
             ORDER BY prediction_date ASC"
        ))?;
        let rows = stmt
            .query_map(params![trend_id, start_key, end_key], TrendOutcome::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
