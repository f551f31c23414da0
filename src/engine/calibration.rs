// Horadus — Calibration Service
//
// Records predicted-vs-actual outcomes and measures how honest the
// probability engine is. The prediction for an outcome date is resolved
// from the snapshot series (latest at or before the date), Brier-scored
// against the resolved outcome, and aggregated into reliability buckets.
// Drift alerts fire when mean Brier or the worst bucket error crosses the
// configured thresholds with enough resolved samples behind them.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{OutcomeType, RiskLevel, TrendOutcome};
use crate::engine::observability::record_drift_alert;
use crate::engine::store::Store;
use crate::engine::trend::logodds_to_prob;
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

const DEFAULT_BUCKET_COUNT: usize = 10;
const BAND_HALF_WIDTH: f64 = 0.10;
const CONFIDENCE_FLAG_THRESHOLD: f64 = 0.05;

// ── Risk presentation helpers ──────────────────────────────────────────────

/// Map probability to its categorical risk band.
pub fn get_risk_level(probability: f64) -> RiskLevel {
    if probability < 0.10 {
        RiskLevel::Low
    } else if probability < 0.25 {
        RiskLevel::Guarded
    } else if probability < 0.50 {
        RiskLevel::Elevated
    } else if probability < 0.75 {
        RiskLevel::High
    } else {
        RiskLevel::Severe
    }
}

/// Symmetric probability band around a point estimate, clamped to the
/// exposed probability range.
pub fn get_probability_band(probability: f64) -> (f64, f64) {
    let low = (probability - BAND_HALF_WIDTH).max(0.001);
    let high = (probability + BAND_HALF_WIDTH).min(0.999);
    (low, high)
}

/// Brier score `(p − a)²`; None for outcomes that have not resolved.
pub fn calculate_brier_score(predicted_probability: f64, outcome: OutcomeType) -> Option<f64> {
    let actual = outcome.actual_value()?;
    Some((predicted_probability - actual).powi(2))
}

// ── Reliability buckets ────────────────────────────────────────────────────

/// Calibration statistics for one probability bucket.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationBucket {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub prediction_count: usize,
    pub occurred_count: usize,
    pub actual_rate: f64,
    pub expected_rate: f64,
    pub calibration_error: f64,
}

/// Group scored outcomes by probability range and compute per-bucket error.
pub fn build_calibration_buckets(
    outcomes: &[TrendOutcome],
    bucket_count: usize,
) -> EngineResult<Vec<CalibrationBucket>> {
    if bucket_count == 0 {
        return Err(EngineError::validation("bucket_count must be >= 1"));
    }
    let bucket_width = 1.0 / bucket_count as f64;
    let mut counts = vec![0usize; bucket_count];
    let mut occurred = vec![0usize; bucket_count];
    let mut actual_sums = vec![0.0f64; bucket_count];

    for outcome in outcomes {
        let Some(actual) = outcome.outcome.actual_value() else {
            continue;
        };
        let probability = outcome.predicted_probability.clamp(0.0, 1.0);
        let index = ((probability / bucket_width) as usize).min(bucket_count - 1);
        counts[index] += 1;
        if outcome.outcome == OutcomeType::Occurred {
            occurred[index] += 1;
        }
        actual_sums[index] += actual;
    }

    let mut buckets = Vec::new();
    for index in 0..bucket_count {
        if counts[index] == 0 {
            continue;
        }
        let bucket_start = index as f64 * bucket_width;
        let bucket_end = bucket_start + bucket_width;
        let actual_rate = actual_sums[index] / counts[index] as f64;
        let expected_rate = (bucket_start + bucket_end) / 2.0;
        buckets.push(CalibrationBucket {
            bucket_start,
            bucket_end,
            prediction_count: counts[index],
            occurred_count: occurred[index],
            actual_rate,
            expected_rate,
            calibration_error: (actual_rate - expected_rate).abs(),
        });
    }
    Ok(buckets)
}

/// Overall calibration report for one trend.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationReport {
    pub total_predictions: usize,
    pub resolved_predictions: usize,
    pub mean_brier_score: Option<f64>,
    pub buckets: Vec<CalibrationBucket>,
    pub overconfident: bool,
    pub underconfident: bool,
}

// ── Drift alerts ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DriftThresholds {
    pub min_resolved_outcomes: usize,
    pub brier_warn: f64,
    pub brier_critical: f64,
    pub bucket_error_warn: f64,
    pub bucket_error_critical: f64,
}

impl DriftThresholds {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        DriftThresholds {
            min_resolved_outcomes: settings.calibration_drift_min_resolved_outcomes,
            brier_warn: settings.calibration_drift_brier_warn_threshold,
            brier_critical: settings.calibration_drift_brier_critical_threshold,
            bucket_error_warn: settings.calibration_drift_bucket_error_warn_threshold,
            bucket_error_critical: settings.calibration_drift_bucket_error_critical_threshold,
        }
    }
}

/// Calibration drift alert emitted when thresholds are breached.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationDriftAlert {
    pub alert_type: String,
    pub severity: String,
    pub metric_name: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub sample_size: usize,
    pub message: String,
}

fn severity_for(value: f64, warn: f64, critical: f64) -> Option<(&'static str, f64)> {
    if critical > 0.0 && value >= critical {
        Some(("critical", critical))
    } else if warn > 0.0 && value >= warn {
        Some(("warning", warn))
    } else {
        None
    }
}

/// Evaluate a report against the drift thresholds. Emits a counter and a
/// warning log per alert; the webhook notifier consumes the returned list.
pub fn build_drift_alerts(
    report: &CalibrationReport,
    thresholds: &DriftThresholds,
) -> Vec<CalibrationDriftAlert> {
    if report.resolved_predictions < thresholds.min_resolved_outcomes {
        return Vec::new();
    }

    let mut alerts = Vec::new();
    if let Some(mean_brier) = report.mean_brier_score {
        if let Some((severity, threshold)) =
            severity_for(mean_brier, thresholds.brier_warn, thresholds.brier_critical)
        {
            alerts.push(CalibrationDriftAlert {
                alert_type: "mean_brier_drift".into(),
                severity: severity.into(),
                metric_name: "mean_brier_score".into(),
                metric_value: mean_brier,
                threshold,
                sample_size: report.resolved_predictions,
                message: format!(
                    "Mean Brier score exceeded calibration drift threshold \
                     ({mean_brier:.3} >= {threshold:.3})."
                ),
            });
        }
    }

    if let Some(worst) = report.buckets.iter().max_by(|a, b| {
        a.calibration_error
            .partial_cmp(&b.calibration_error)
            .unwrap_or(std::cmp::Ordering::Equal)
    }) {
        if let Some((severity, threshold)) = severity_for(
            worst.calibration_error,
            thresholds.bucket_error_warn,
            thresholds.bucket_error_critical,
        ) {
            alerts.push(CalibrationDriftAlert {
                alert_type: "bucket_error_drift".into(),
                severity: severity.into(),
                metric_name: "bucket_calibration_error".into(),
                metric_value: worst.calibration_error,
                threshold,
                sample_size: worst.prediction_count,
                message: format!(
                    "Reliability bucket [{:.1}, {:.1}) error exceeded drift threshold \
                     ({:.3} >= {:.3}).",
                    worst.bucket_start, worst.bucket_end, worst.calibration_error, threshold
                ),
            });
        }
    }

    for alert in &alerts {
        record_drift_alert(&alert.alert_type, &alert.severity);
        warn!(
            "[calibration] Drift alert: type={} severity={} value={:.4} threshold={:.4} samples={}",
            alert.alert_type, alert.severity, alert.metric_value, alert.threshold, alert.sample_size
        );
    }
    alerts
}

// ── Service ────────────────────────────────────────────────────────────────

pub struct CalibrationService {
    store: Arc<Store>,
}

impl CalibrationService {
    pub fn new(store: Arc<Store>) -> Self {
        CalibrationService { store }
    }

    /// Record an observed outcome against the probability the engine was
    /// publishing at the outcome date.
    pub fn record_outcome(
        &self,
        trend_id: &str,
        outcome_date: DateTime<Utc>,
        outcome: OutcomeType,
        notes: Option<&str>,
        evidence: Option<serde_json::Value>,
        recorded_by: Option<&str>,
    ) -> EngineResult<TrendOutcome> {
        let trend = self
            .store
            .get_trend(trend_id)?
            .ok_or_else(|| EngineError::not_found(format!("trend '{trend_id}'")))?;

        let predicted_probability =
            match self.store.latest_snapshot_at_or_before(trend_id, outcome_date)? {
                Some(snapshot) => logodds_to_prob(snapshot.log_odds),
                None => logodds_to_prob(trend.current_log_odds),
            };
        let (band_low, band_high) = get_probability_band(predicted_probability);

        let record = TrendOutcome {
            id: Uuid::new_v4().to_string(),
            trend_id: trend_id.to_string(),
            prediction_date: outcome_date,
            predicted_probability,
            predicted_risk_level: get_risk_level(predicted_probability),
            probability_band_low: band_low,
            probability_band_high: band_high,
            outcome,
            outcome_notes: notes.map(str::to_string),
            outcome_evidence: evidence,
            brier_score: calculate_brier_score(predicted_probability, outcome),
            recorded_by: recorded_by.map(str::to_string),
        };
        self.store.insert_outcome(&record)?;
        Ok(record)
    }

    /// Reliability report over a trend's recorded outcomes.
    pub fn get_calibration_report(
        &self,
        trend_id: &str,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> EngineResult<CalibrationReport> {
        let outcomes = self.store.list_outcomes(trend_id, start_date, end_date)?;
        let scored: Vec<&TrendOutcome> = outcomes
            .iter()
            .filter(|outcome| outcome.outcome.actual_value().is_some())
            .collect();

        let mut brier_values = Vec::with_capacity(scored.len());
        let mut signed_error = 0.0;
        for outcome in &scored {
            let brier = outcome.brier_score.or_else(|| {
                calculate_brier_score(outcome.predicted_probability, outcome.outcome)
            });
            if let Some(brier) = brier {
                brier_values.push(brier);
            }
            if let Some(actual) = outcome.outcome.actual_value() {
                signed_error += actual - outcome.predicted_probability;
            }
        }
        let mean_brier_score = if brier_values.is_empty() {
            None
        } else {
            Some(brier_values.iter().sum::<f64>() / brier_values.len() as f64)
        };
        let mean_signed_error = if scored.is_empty() {
            0.0
        } else {
            signed_error / scored.len() as f64
        };

        let scored_owned: Vec<TrendOutcome> = scored.into_iter().cloned().collect();
        Ok(CalibrationReport {
            total_predictions: outcomes.len(),
            resolved_predictions: scored_owned.len(),
            mean_brier_score,
            buckets: build_calibration_buckets(&scored_owned, DEFAULT_BUCKET_COUNT)?,
            overconfident: mean_signed_error < -CONFIDENCE_FLAG_THRESHOLD,
            underconfident: mean_signed_error > CONFIDENCE_FLAG_THRESHOLD,
        })
    }
}
