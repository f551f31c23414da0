// Horadus — Chat Failover Invoker
//
// One invocation = primary route with bounded retries, then (only for
// retryable failures) the secondary route with its own retry budget.
// Retryable: rate limit (429), provider 5xx, timeout, connection errors.
// Backoff is exponential with ±25% jitter, capped at 30 seconds, and a
// cancellation flag is honored between attempts.

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::llm::provider::{ChatBackend, ChatCompletion, ChatMessage, ChatRequest, ResponseFormat};
use log::warn;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Maximum backoff between retry attempts.
const MAX_BACKOFF_SECONDS: f64 = 30.0;

// ── Routes & policy ────────────────────────────────────────────────────────

/// One provider/model route for chat completion calls.
#[derive(Clone)]
pub struct ChatRoute {
    pub provider: String,
    pub model: String,
    pub backend: Arc<dyn ChatBackend>,
}

impl ChatRoute {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        ChatRoute {
            provider: provider.into(),
            model: model.into(),
            backend,
        }
    }
}

/// Retry controls for one route before failover.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_seconds: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_seconds: f64) -> EngineResult<Self> {
        if max_attempts < 1 {
            return Err(EngineError::validation("retry policy requires max_attempts >= 1"));
        }
        if backoff_seconds < 0.0 {
            return Err(EngineError::validation(
                "retry policy requires backoff_seconds >= 0",
            ));
        }
        Ok(RetryPolicy {
            max_attempts,
            backoff_seconds,
        })
    }

    /// Exponential backoff for a 1-based attempt number, jittered ±25%,
    /// capped at 30s.
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if self.backoff_seconds <= 0.0 {
            return Duration::ZERO;
        }
        let base = self.backoff_seconds * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(MAX_BACKOFF_SECONDS);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(capped * jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 2,
            backoff_seconds: 0.25,
        }
    }
}

// ── Error classification ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationErrorCode {
    RateLimit,
    ProviderHttp5xx,
    Timeout,
    Connection,
    NonRetryable,
}

impl InvocationErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationErrorCode::RateLimit => "rate_limit",
            InvocationErrorCode::ProviderHttp5xx => "http_5xx",
            InvocationErrorCode::Timeout => "timeout",
            InvocationErrorCode::Connection => "connection_error",
            InvocationErrorCode::NonRetryable => "non_retryable",
        }
    }
}

/// Classify an engine error for retry/failover purposes.
pub fn classify_error(error: &EngineError) -> InvocationErrorCode {
    match error {
        EngineError::Provider { status, .. } => match status {
            Some(429) => InvocationErrorCode::RateLimit,
            Some(code) if *code >= 500 => InvocationErrorCode::ProviderHttp5xx,
            _ => InvocationErrorCode::NonRetryable,
        },
        EngineError::Network(err) => {
            if err.is_timeout() {
                InvocationErrorCode::Timeout
            } else if err.is_connect() {
                InvocationErrorCode::Connection
            } else if let Some(status) = err.status() {
                if status.as_u16() == 429 {
                    InvocationErrorCode::RateLimit
                } else if status.is_server_error() {
                    InvocationErrorCode::ProviderHttp5xx
                } else {
                    InvocationErrorCode::NonRetryable
                }
            } else {
                InvocationErrorCode::Connection
            }
        }
        _ => InvocationErrorCode::NonRetryable,
    }
}

pub fn is_retryable_error(error: &EngineError) -> bool {
    classify_error(error) != InvocationErrorCode::NonRetryable
}

// ── Invoker ────────────────────────────────────────────────────────────────

pub struct ChatFailoverInvoker {
    pub stage: String,
    primary: ChatRoute,
    secondary: Option<ChatRoute>,
    retry_policy: RetryPolicy,
    cancelled: Option<Arc<AtomicBool>>,
}

impl ChatFailoverInvoker {
    pub fn new(
        stage: impl Into<String>,
        primary: ChatRoute,
        secondary: Option<ChatRoute>,
        retry_policy: RetryPolicy,
    ) -> Self {
        ChatFailoverInvoker {
            stage: stage.into(),
            primary,
            secondary,
            retry_policy,
            cancelled: None,
        }
    }

    /// Honor a shutdown flag between retry attempts.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(flag);
        self
    }

    pub fn routes(&self) -> (&ChatRoute, Option<&ChatRoute>) {
        (&self.primary, self.secondary.as_ref())
    }

    /// Invoke the primary route with retries; on an exhausted retryable
    /// failure, switch to the secondary with a fresh retry budget.
    pub async fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        response_format: Option<ResponseFormat>,
    ) -> EngineResult<(ChatCompletion, String)> {
        let (primary_result, primary_attempts) = self
            .invoke_route(&self.primary, messages, temperature, response_format.clone())
            .await;
        let primary_error = match primary_result {
            Ok(completion) => return Ok((completion, self.primary.provider.clone())),
            Err(error) => error,
        };

        let Some(secondary) = &self.secondary else {
            return Err(primary_error);
        };
        if !is_retryable_error(&primary_error) {
            return Err(primary_error);
        }

        warn!(
            "[llm] Failover activated: stage={} reason={} primary={}:{} secondary={}:{} attempts={}/{}",
            self.stage,
            classify_error(&primary_error).as_str(),
            self.primary.provider,
            self.primary.model,
            secondary.provider,
            secondary.model,
            primary_attempts,
            self.retry_policy.max_attempts,
        );

        let (secondary_result, secondary_attempts) = self
            .invoke_route(secondary, messages, temperature, response_format)
            .await;
        match secondary_result {
            Ok(completion) => Ok((completion, secondary.provider.clone())),
            Err(error) => {
                warn!(
                    "[llm] Failover route failed: stage={} provider={}:{} reason={} attempts={}/{}",
                    self.stage,
                    secondary.provider,
                    secondary.model,
                    classify_error(&error).as_str(),
                    secondary_attempts,
                    self.retry_policy.max_attempts,
                );
                Err(error)
            }
        }
    }

    /// Run one route with its retry budget. Returns the result and the
    /// number of attempts consumed.
    async fn invoke_route(
        &self,
        route: &ChatRoute,
        messages: &[ChatMessage],
        temperature: f64,
        response_format: Option<ResponseFormat>,
    ) -> (EngineResult<ChatCompletion>, u32) {
        let request = ChatRequest {
            model: route.model.clone(),
            temperature,
            messages: messages.to_vec(),
            response_format,
        };
        let mut last_error: Option<EngineError> = None;
        for attempt in 1..=self.retry_policy.max_attempts {
            if self.is_cancelled() {
                return (
                    Err(last_error
                        .unwrap_or_else(|| EngineError::Other("invocation cancelled".into()))),
                    attempt,
                );
            }
            match route.backend.chat(&request).await {
                Ok(completion) => return (Ok(completion), attempt),
                Err(error) => {
                    let retryable = is_retryable_error(&error);
                    if !retryable || attempt >= self.retry_policy.max_attempts {
                        return (Err(error), attempt);
                    }
                    let backoff = self.retry_policy.backoff_for_attempt(attempt);
                    warn!(
                        "[llm] Route retry scheduled: stage={} provider={}:{} reason={} attempt={}/{} backoff={:.2}s",
                        self.stage,
                        route.provider,
                        route.model,
                        classify_error(&error).as_str(),
                        attempt,
                        self.retry_policy.max_attempts,
                        backoff.as_secs_f64(),
                    );
                    last_error = Some(error);
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        (
            Err(last_error.unwrap_or_else(|| EngineError::Other("retry loop exhausted".into()))),
            self.retry_policy.max_attempts,
        )
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}
