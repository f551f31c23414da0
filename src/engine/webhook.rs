// Horadus — Drift Alert Webhook Notifier
//
// Outbound-only delivery of calibration drift alerts. Retries with
// exponential backoff (capped at 60s) on 429, 5xx, and network errors;
// anything else fails fast. Delivery failures are logged, never raised —
// alerting must not destabilize the scheduler.

use crate::atoms::error::EngineResult;
use crate::engine::calibration::CalibrationDriftAlert;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

const MAX_BACKOFF_SECONDS: f64 = 60.0;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub webhook_url: Option<String>,
    pub timeout_seconds: f64,
    pub max_retries: u32,
    pub backoff_seconds: f64,
}

impl WebhookConfig {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        WebhookConfig {
            webhook_url: settings.calibration_drift_webhook_url.clone(),
            timeout_seconds: settings.calibration_drift_webhook_timeout_seconds,
            max_retries: settings.calibration_drift_webhook_max_retries,
            backoff_seconds: settings.calibration_drift_webhook_backoff_seconds,
        }
    }
}

pub struct DriftAlertWebhookNotifier {
    client: Client,
    config: WebhookConfig,
}

impl DriftAlertWebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        DriftAlertWebhookNotifier {
            client: Client::builder()
                .timeout(Duration::from_secs_f64(config.timeout_seconds.max(0.1)))
                .build()
                .unwrap_or_default(),
            config,
        }
    }

    /// Deliver a batch of drift alerts. Returns true when the webhook
    /// accepted the payload; false when unconfigured, empty, or exhausted.
    pub async fn notify(
        &self,
        trend_scope: &str,
        generated_at: DateTime<Utc>,
        alerts: &[CalibrationDriftAlert],
    ) -> EngineResult<bool> {
        let Some(url) = self.config.webhook_url.as_deref() else {
            return Ok(false);
        };
        if alerts.is_empty() {
            return Ok(false);
        }

        let payload = json!({
            "event_type": "calibration_drift_alerts",
            "generated_at": generated_at.to_rfc3339(),
            "trend_scope": trend_scope,
            "alert_count": alerts.len(),
            "alerts": alerts,
        });
        let max_attempts = self.config.max_retries + 1;

        for attempt in 1..=max_attempts {
            let outcome = self.client.post(url).json(&payload).send().await;
            let (retryable, detail) = match outcome {
                Ok(response) if response.status().is_success() => {
                    info!(
                        "[webhook] Drift alerts delivered: scope={} alerts={} attempts={}",
                        trend_scope,
                        alerts.len(),
                        attempt
                    );
                    return Ok(true);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    (
                        status == 429 || status >= 500,
                        format!("http_status={status}"),
                    )
                }
                Err(error) => (true, error.to_string()),
            };

            if !retryable || attempt >= max_attempts {
                warn!(
                    "[webhook] Drift alert delivery failed: scope={} alerts={} attempts={}/{} \
                     retryable={} error={}",
                    trend_scope,
                    alerts.len(),
                    attempt,
                    max_attempts,
                    retryable,
                    detail
                );
                return Ok(false);
            }

            let delay = self.backoff_for_attempt(attempt);
            debug!(
                "[webhook] Retrying drift alert delivery: scope={} attempt={}/{} delay={:.1}s",
                trend_scope,
                attempt,
                max_attempts,
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }
        Ok(false)
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if self.config.backoff_seconds <= 0.0 {
            return Duration::ZERO;
        }
        let base = self.config.backoff_seconds * 2f64.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(base.min(MAX_BACKOFF_SECONDS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(url: Option<&str>, backoff: f64) -> DriftAlertWebhookNotifier {
        DriftAlertWebhookNotifier::new(WebhookConfig {
            webhook_url: url.map(str::to_string),
            timeout_seconds: 1.0,
            max_retries: 2,
            backoff_seconds: backoff,
        })
    }

    fn alert() -> CalibrationDriftAlert {
        CalibrationDriftAlert {
            alert_type: "mean_brier_drift".into(),
            severity: "warning".into(),
            metric_name: "mean_brier_score".into(),
            metric_value: 0.22,
            threshold: 0.20,
            sample_size: 30,
            message: "Mean Brier score exceeded calibration drift threshold.".into(),
        }
    }

    #[tokio::test]
    async fn unconfigured_or_empty_is_a_noop() {
        let unconfigured = notifier(None, 0.0);
        assert!(!unconfigured.notify("all", Utc::now(), &[alert()]).await.unwrap());

        let empty_alerts = notifier(Some("http://127.0.0.1:9"), 0.0);
        assert!(!empty_alerts.notify("all", Utc::now(), &[]).await.unwrap());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let notifier = notifier(Some("http://example.invalid"), 4.0);
        assert_eq!(notifier.backoff_for_attempt(1).as_secs_f64(), 4.0);
        assert_eq!(notifier.backoff_for_attempt(2).as_secs_f64(), 8.0);
        assert!(notifier.backoff_for_attempt(10).as_secs_f64() <= MAX_BACKOFF_SECONDS);
    }
}
