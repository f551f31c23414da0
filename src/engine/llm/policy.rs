// Horadus — Unified LLM Invocation Policy
//
// One entry point for every classifier call. Order of concerns:
//   1. budget check (per tier) before any network traffic
//   2. strict json_schema response format first; if the provider 400s with
//      a schema-unsupported complaint, retry the same invoker with the
//      json_object compatibility format
//   3. retries + failover are delegated to the ChatFailoverInvoker
//   4. on success, record actual usage with the cost tracker and estimate
//      the request cost from the pricing table

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::LlmTier;
use crate::engine::cost::CostTracker;
use crate::engine::llm::failover::ChatFailoverInvoker;
use crate::engine::llm::pricing::estimate_model_cost_usd;
use crate::engine::llm::provider::{ChatMessage, ResponseFormat};
use crate::engine::observability::record_llm_api_call;
use log::warn;

/// Result of one governed invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub content: String,
    pub active_model: String,
    pub active_provider: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub estimated_cost_usd: f64,
}

/// True for provider 400s that look like the strict json_schema response
/// format is unsupported (rather than a genuinely bad request).
pub fn is_strict_schema_unsupported_error(error: &EngineError) -> bool {
    if error.provider_status() != Some(400) {
        return false;
    }
    let message = error.to_string().to_lowercase();
    message.contains("json_schema") || message.contains("response_format") || message.contains("strict")
}

#[allow(clippy::too_many_arguments)]
pub async fn invoke_with_policy(
    invoker: &ChatFailoverInvoker,
    cost_tracker: &CostTracker,
    tier: LlmTier,
    messages: &[ChatMessage],
    temperature: f64,
    strict_format: Option<ResponseFormat>,
    fallback_format: Option<ResponseFormat>,
) -> EngineResult<InvocationOutcome> {
    cost_tracker.ensure_within_budget(tier)?;

    let completion_and_provider = match strict_format {
        Some(strict) => {
            match invoker
                .create_chat_completion(messages, temperature, Some(strict))
                .await
            {
                Ok(result) => result,
                Err(error)
                    if fallback_format.is_some()
                        && is_strict_schema_unsupported_error(&error) =>
                {
                    warn!(
                        "[llm] Strict schema unsupported, retrying with compatibility format: stage={}",
                        invoker.stage
                    );
                    invoker
                        .create_chat_completion(messages, temperature, fallback_format)
                        .await?
                }
                Err(error) => return Err(error),
            }
        }
        None => {
            invoker
                .create_chat_completion(messages, temperature, fallback_format)
                .await?
        }
    };
    let (completion, active_provider) = completion_and_provider;

    record_llm_api_call(invoker.stage.as_str());
    cost_tracker.record_usage(
        tier,
        completion.usage.prompt_tokens,
        completion.usage.completion_tokens,
    )?;

    let estimated_cost_usd = estimate_model_cost_usd(
        &completion.model,
        completion.usage.prompt_tokens,
        completion.usage.completion_tokens,
    );
    Ok(InvocationOutcome {
        content: completion.content,
        active_model: completion.model,
        active_provider,
        prompt_tokens: completion.usage.prompt_tokens,
        completion_tokens: completion.usage.completion_tokens,
        estimated_cost_usd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cost::{CostLimits, CostTracker};
    use crate::engine::llm::failover::{ChatRoute, RetryPolicy};
    use crate::engine::llm::provider::test_support::ScriptedChatBackend;
    use crate::engine::store::Store;
    use serde_json::json;
    use std::sync::Arc;

    fn tracker(calls: i64) -> CostTracker {
        CostTracker::new(
            Arc::new(Store::open_in_memory().unwrap()),
            CostLimits {
                tier1_max_daily_calls: calls,
                tier2_max_daily_calls: calls,
                embedding_max_daily_calls: calls,
                daily_cost_limit_usd: 0.0,
                cost_alert_threshold_pct: 0,
            },
        )
    }

    fn invoker(backend: Arc<ScriptedChatBackend>) -> ChatFailoverInvoker {
        ChatFailoverInvoker::new(
            "tier1",
            ChatRoute::new("openai", "gpt-4.1-nano", backend),
            None,
            RetryPolicy {
                max_attempts: 1,
                backoff_seconds: 0.0,
            },
        )
    }

    fn strict() -> ResponseFormat {
        ResponseFormat::JsonSchema {
            name: "out".into(),
            schema: json!({ "type": "object" }),
        }
    }

    #[tokio::test]
    async fn budget_denial_prevents_any_call() {
        let backend = Arc::new(ScriptedChatBackend::new(vec![Ok(
            ScriptedChatBackend::completion("{}", "gpt-4.1-nano"),
        )]));
        let tracker = tracker(1);
        tracker.record_usage(crate::atoms::types::LlmTier::Tier1, 1, 1).unwrap();

        let error = invoke_with_policy(
            &invoker(backend.clone()),
            &tracker,
            LlmTier::Tier1,
            &[ChatMessage::user("x")],
            0.0,
            None,
            None,
        )
        .await
        .unwrap_err();
        assert!(error.is_budget_exceeded());
        assert_eq!(backend.calls(), 0, "budget denial must short-circuit");
    }

    #[tokio::test]
    async fn strict_schema_falls_back_to_json_object() {
        let backend = Arc::new(ScriptedChatBackend::new(vec![
            Err(EngineError::provider(
                "openai",
                Some(400),
                "response_format json_schema is not supported for this model",
            )),
            Ok(ScriptedChatBackend::completion("{\"ok\":true}", "gpt-4.1-nano")),
        ]));
        let tracker = tracker(10);
        let outcome = invoke_with_policy(
            &invoker(backend.clone()),
            &tracker,
            LlmTier::Tier1,
            &[ChatMessage::user("x")],
            0.0,
            Some(strict()),
            Some(ResponseFormat::JsonObject),
        )
        .await
        .unwrap();
        assert_eq!(outcome.content, "{\"ok\":true}");
        assert_eq!(backend.calls(), 2);

        // Second request used the compatibility format.
        let requests = backend.requests.lock();
        assert!(matches!(
            requests[1].response_format,
            Some(ResponseFormat::JsonObject)
        ));
    }

    #[tokio::test]
    async fn genuine_bad_request_is_not_retried_as_fallback() {
        let backend = Arc::new(ScriptedChatBackend::new(vec![Err(EngineError::provider(
            "openai",
            Some(400),
            "missing required parameter messages",
        ))]));
        let tracker = tracker(10);
        let error = invoke_with_policy(
            &invoker(backend.clone()),
            &tracker,
            LlmTier::Tier1,
            &[ChatMessage::user("x")],
            0.0,
            Some(strict()),
            Some(ResponseFormat::JsonObject),
        )
        .await
        .unwrap_err();
        assert_eq!(error.provider_status(), Some(400));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn success_records_usage_and_estimates_cost() {
        let backend = Arc::new(ScriptedChatBackend::new(vec![Ok(
            ScriptedChatBackend::completion("{}", "gpt-4.1-nano"),
        )]));
        let tracker = tracker(10);
        let outcome = invoke_with_policy(
            &invoker(backend),
            &tracker,
            LlmTier::Tier1,
            &[ChatMessage::user("x")],
            0.0,
            None,
            Some(ResponseFormat::JsonObject),
        )
        .await
        .unwrap();
        assert_eq!(outcome.prompt_tokens, 10);
        assert_eq!(outcome.completion_tokens, 5);
        assert!(outcome.estimated_cost_usd > 0.0);

        let summary = tracker.get_daily_summary().unwrap();
        assert_eq!(summary.tiers["tier1"].calls, 1);
        assert_eq!(summary.tiers["tier1"].input_tokens, 10);
    }
}
