//! OpenAI-compatible chat-completions client.
//!
//! One reqwest client, capped exponential backoff with jitter on
//! retriable statuses, and structured output via `response_format:
//! json_schema`. Every successful call lands in the usage ledger.

use crate::error::{LlmError, Result};
use crate::llm::{
    self, ChatMessage, CompletionRequest, LlmClient, MAX_SCHEMA_RETRIES, MAX_TRANSIENT_RETRIES,
};
use crate::store::{Content, Part, Role, Store};
use anyhow::Context as _;
use serde_json::{json, Value};

/// Rough $/1M-token rates for the cost column when the provider doesn't
/// price the call for us. Close enough for the usage dashboard.
const DEFAULT_PROMPT_RATE: f64 = 1.0;
const DEFAULT_COMPLETION_RATE: f64 = 4.0;

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    store: Store,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, store: Store) -> Result<Self> {
        Self::with_base_url("https://api.openai.com/v1", api_key, store)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        store: Store,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            store,
        })
    }

    /// One POST to /chat/completions with transient-failure retries.
    async fn request_completion(&self, body: &Value, caller: &str, model: &str) -> Result<Value> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_error = String::new();

        for attempt in 0..MAX_TRANSIENT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(llm::backoff_delay(attempt - 1)).await;
            }

            let response = match self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    last_error = error.to_string();
                    tracing::warn!(%error, attempt, "LLM request failed, retrying");
                    continue;
                }
            };

            let status = response.status().as_u16();
            if llm::is_retriable_status(status) {
                last_error = format!("HTTP {status}");
                tracing::warn!(status, attempt, "LLM provider returned retriable status");
                continue;
            }

            let payload: Value = response
                .error_for_status()
                .map_err(|error| LlmError::ProviderRequest(error.to_string()))?
                .json()
                .await
                .map_err(|error| LlmError::ProviderRequest(error.to_string()))?;

            self.record_usage(&payload, caller, model).await;
            return Ok(payload);
        }

        Err(LlmError::CompletionFailed(format!(
            "gave up after {MAX_TRANSIENT_RETRIES} attempts: {last_error}"
        ))
        .into())
    }

    async fn record_usage(&self, payload: &Value, caller: &str, model: &str) {
        let prompt_tokens = payload["usage"]["prompt_tokens"].as_i64().unwrap_or(0);
        let completion_tokens = payload["usage"]["completion_tokens"].as_i64().unwrap_or(0);
        let cost = (prompt_tokens as f64 * DEFAULT_PROMPT_RATE
            + completion_tokens as f64 * DEFAULT_COMPLETION_RATE)
            / 1_000_000.0;

        if let Err(error) = self
            .store
            .record_usage(caller, model, prompt_tokens, completion_tokens, cost)
            .await
        {
            tracing::warn!(%error, "failed to record LLM usage");
        }
    }
}

impl LlmClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let body = json!({
            "model": request.model,
            "temperature": request.temperature,
            "messages": wire_messages(&request.messages),
        });

        let payload = self
            .request_completion(&body, request.caller, &request.model)
            .await?;

        content_text(&payload)
    }

    async fn complete_structured(
        &self,
        request: CompletionRequest,
        schema_name: &str,
        schema: Value,
    ) -> Result<Value> {
        let mut messages = request.messages.clone();
        let mut last_error = String::new();

        for attempt in 0..MAX_SCHEMA_RETRIES {
            if attempt > 0 {
                messages.push(ChatMessage::new(
                    Role::User,
                    format!(
                        "The previous response was not valid JSON ({last_error}). \
                         Respond with a single JSON object only."
                    ),
                ));
            }

            let body = json!({
                "model": request.model,
                "temperature": request.temperature,
                "messages": wire_messages(&messages),
                "response_format": {
                    "type": "json_schema",
                    "json_schema": {
                        "name": schema_name,
                        "schema": schema.clone(),
                    },
                },
            });

            let payload = self
                .request_completion(&body, request.caller, &request.model)
                .await?;
            let text = content_text(&payload)?;

            match serde_json::from_str::<Value>(&text) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    tracing::warn!(%error, attempt, schema = schema_name, "structured response was not JSON");
                    last_error = error.to_string();
                }
            }
        }

        Err(LlmError::SchemaViolation(format!(
            "{schema_name} response was not JSON after {MAX_SCHEMA_RETRIES} attempts: {last_error}"
        ))
        .into())
    }
}

fn content_text(payload: &Value) -> Result<String> {
    payload["choices"][0]["message"]["content"]
        .as_str()
        .map(|text| text.to_string())
        .ok_or_else(|| {
            LlmError::ProviderRequest("completion response carried no message content".to_string())
                .into()
        })
}

/// Convert stored messages to the wire shape. Consecutive same-role text
/// messages are merged; multipart content becomes the text/image_url
/// block list.
fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());

    for message in messages {
        let role = message.role.as_str();

        match &message.content {
            Content::Text(text) => {
                if let Some(last) = wire.last_mut()
                    && last["role"] == role
                    && last["content"].is_string()
                {
                    let merged = format!("{}\n\n{}", last["content"].as_str().unwrap_or(""), text);
                    last["content"] = Value::String(merged);
                    continue;
                }
                wire.push(json!({"role": role, "content": text}));
            }
            Content::Multipart(parts) => {
                let blocks: Vec<Value> = parts
                    .iter()
                    .map(|part| match part {
                        Part::Text { text } => json!({"type": "text", "text": text}),
                        Part::Image { data } => json!({
                            "type": "image_url",
                            "image_url": {"url": format!("data:image/png;base64,{data}")},
                        }),
                    })
                    .collect();
                wire.push(json!({"role": role, "content": blocks}));
            }
        }
    }

    wire
}
