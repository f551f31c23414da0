// Horadus — Chat Provider Seam
//
// `ChatBackend` is the trait boundary between the engine and whatever LLM
// endpoint is configured. The HTTP implementation speaks the OpenAI
// chat-completions wire shape and adapts the responses-API shape
// transparently, normalizing usage counts to {prompt_tokens,
// completion_tokens} so the rest of the engine never sees the difference.

use crate::atoms::error::{EngineError, EngineResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

// ── Request / response types ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Structured-output request mode.
#[derive(Debug, Clone)]
pub enum ResponseFormat {
    /// `response_format = {type: json_schema, json_schema: {...}, strict}`.
    JsonSchema { name: String, schema: Value },
    /// Compatibility mode: `response_format = {type: json_object}`.
    JsonObject,
}

impl ResponseFormat {
    fn to_wire(&self) -> Value {
        match self {
            ResponseFormat::JsonSchema { name, schema } => json!({
                "type": "json_schema",
                "json_schema": { "name": name, "schema": schema, "strict": true },
            }),
            ResponseFormat::JsonObject => json!({ "type": "json_object" }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub temperature: f64,
    pub messages: Vec<ChatMessage>,
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: String,
    pub model: String,
    pub usage: ChatUsage,
}

/// Type-erased chat endpoint. Tests inject scripted implementations.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> EngineResult<ChatCompletion>;
}

// ── HTTP implementation ────────────────────────────────────────────────────

/// Which wire shape the endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMode {
    ChatCompletions,
    Responses,
}

pub struct HttpChatBackend {
    client: Client,
    provider_name: String,
    base_url: String,
    api_key: String,
    api_mode: ApiMode,
}

impl HttpChatBackend {
    pub fn new(
        provider_name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_mode: ApiMode,
        timeout_seconds: u64,
    ) -> Self {
        HttpChatBackend {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(timeout_seconds))
                .build()
                .unwrap_or_default(),
            provider_name: provider_name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_mode,
        }
    }

    async fn chat_completions(&self, request: &ChatRequest) -> EngineResult<ChatCompletion> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();
        let mut body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "messages": messages,
        });
        if let Some(format) = &request.response_format {
            body["response_format"] = format.to_wire();
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                &self.provider_name,
                Some(status.as_u16()),
                detail,
            ));
        }

        let payload: Value = response.json().await?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                EngineError::provider(
                    &self.provider_name,
                    None,
                    "chat completion missing message content",
                )
            })?;
        let model = payload["model"]
            .as_str()
            .unwrap_or(&request.model)
            .to_string();
        let usage = ChatUsage {
            prompt_tokens: payload["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
            completion_tokens: payload["usage"]["completion_tokens"].as_i64().unwrap_or(0),
        };
        Ok(ChatCompletion {
            content,
            model,
            usage,
        })
    }

    async fn responses(&self, request: &ChatRequest) -> EngineResult<ChatCompletion> {
        if request.response_format.is_some() {
            return Err(EngineError::validation(
                "responses API adapter does not support response_format",
            ));
        }
        let url = format!("{}/v1/responses", self.base_url.trim_end_matches('/'));
        let input: Vec<Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role,
                    "content": [{ "type": "input_text", "text": m.content }],
                })
            })
            .collect();
        let body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "input": input,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                &self.provider_name,
                Some(status.as_u16()),
                detail,
            ));
        }

        let payload: Value = response.json().await?;
        let content = extract_responses_output_text(&payload);
        if content.is_empty() {
            return Err(EngineError::provider(
                &self.provider_name,
                None,
                "responses API returned no output text",
            ));
        }
        let model = payload["model"]
            .as_str()
            .unwrap_or(&request.model)
            .to_string();
        // Responses API reports input/output token names.
        let usage = ChatUsage {
            prompt_tokens: payload["usage"]["input_tokens"].as_i64().unwrap_or(0),
            completion_tokens: payload["usage"]["output_tokens"].as_i64().unwrap_or(0),
        };
        Ok(ChatCompletion {
            content,
            model,
            usage,
        })
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn chat(&self, request: &ChatRequest) -> EngineResult<ChatCompletion> {
        match self.api_mode {
            ApiMode::ChatCompletions => self.chat_completions(request).await,
            ApiMode::Responses => self.responses(request).await,
        }
    }
}

/// Flatten a responses-API payload into plain text: prefer `output_text`,
/// else join the text segments of every output item.
fn extract_responses_output_text(payload: &Value) -> String {
    if let Some(direct) = payload["output_text"].as_str() {
        let trimmed = direct.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let Some(output) = payload["output"].as_array() else {
        return String::new();
    };
    let mut chunks = Vec::new();
    for item in output {
        let Some(content) = item["content"].as_array() else {
            continue;
        };
        for segment in content {
            if let Some(text) = segment["text"].as_str() {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    chunks.push(trimmed.to_string());
                }
            }
        }
    }
    chunks.join("\n")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_format_wire_shapes() {
        let schema = ResponseFormat::JsonSchema {
            name: "tier1".into(),
            schema: json!({ "type": "object" }),
        };
        let wire = schema.to_wire();
        assert_eq!(wire["type"], "json_schema");
        assert_eq!(wire["json_schema"]["strict"], true);

        assert_eq!(ResponseFormat::JsonObject.to_wire()["type"], "json_object");
    }

    #[test]
    fn responses_output_text_extraction() {
        let direct = json!({ "output_text": "  hello  " });
        assert_eq!(extract_responses_output_text(&direct), "hello");

        let segmented = json!({
            "output": [
                { "content": [ { "type": "output_text", "text": "part one" } ] },
                { "content": [ { "type": "output_text", "text": "part two" } ] },
            ]
        });
        assert_eq!(extract_responses_output_text(&segmented), "part one\npart two");

        assert_eq!(extract_responses_output_text(&json!({})), "");
    }
}
