//! The LLM capability boundary.
//!
//! The core treats language models as a black box behind `LlmClient`:
//! plain completions and schema-constrained structured output. The one
//! real implementation speaks the OpenAI-compatible chat-completions
//! wire format; tests substitute a scripted fake.

pub mod fake;
pub mod openai;

pub use fake::FakeLlmClient;
pub use openai::OpenAiClient;

use crate::error::{LlmError, Result};
use crate::store::{Content, Role};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

/// Retry cap for transient provider failures within one call.
pub const MAX_TRANSIENT_RETRIES: u32 = 3;

/// Retry cap for schema-violating structured output, with a corrective
/// prompt appended per attempt.
pub const MAX_SCHEMA_RETRIES: u32 = 3;

/// Base delay for exponential backoff between transient retries.
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// One message in a completion request.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Content,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A completion request. `caller` names the agent tier for the usage
/// ledger.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub caller: &'static str,
    pub model: String,
    pub temperature: f64,
    pub messages: Vec<ChatMessage>,
}

/// Lift a stored message log into a completion request's message list.
pub fn from_log(records: &[crate::store::MessageRecord]) -> Vec<ChatMessage> {
    records
        .iter()
        .map(|record| ChatMessage {
            role: record.role,
            content: record.content.clone(),
        })
        .collect()
}

/// Static trait for LLM clients. Use this for type-safe implementations.
pub trait LlmClient: Send + Sync + 'static {
    /// Plain text completion.
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Structured output constrained by a JSON Schema. Returns the parsed
    /// JSON value; typed validation happens in [`structured`].
    fn complete_structured(
        &self,
        request: CompletionRequest,
        schema_name: &str,
        schema: Value,
    ) -> impl std::future::Future<Output = Result<Value>> + Send;
}

/// Dynamic companion trait for `Arc<dyn LlmClientDyn>` storage.
pub trait LlmClientDyn: Send + Sync + 'static {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>>;

    fn complete_structured<'a>(
        &'a self,
        request: CompletionRequest,
        schema_name: &'a str,
        schema: Value,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send + 'a>>;
}

impl<T: LlmClient> LlmClientDyn for T {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(LlmClient::complete(self, request))
    }

    fn complete_structured<'a>(
        &'a self,
        request: CompletionRequest,
        schema_name: &'a str,
        schema: Value,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(LlmClient::complete_structured(self, request, schema_name, schema))
    }
}

/// Typed structured-output call.
///
/// Generates the schema for `T`, invokes the client, and validates the
/// response. A response that parses as JSON but violates the schema is
/// retried with a corrective prompt, up to [`MAX_SCHEMA_RETRIES`] times.
pub async fn structured<T>(client: &Arc<dyn LlmClientDyn>, request: CompletionRequest) -> Result<T>
where
    T: schemars::JsonSchema + serde::de::DeserializeOwned,
{
    let schema = serde_json::to_value(
        schemars::r#gen::SchemaGenerator::default().into_root_schema_for::<T>(),
    )
    .map_err(|error| LlmError::SchemaViolation(error.to_string()))?;
    let schema_name = short_type_name::<T>();

    let mut request = request;
    let mut last_error = String::new();

    for attempt in 0..MAX_SCHEMA_RETRIES {
        if attempt > 0 {
            request.messages.push(ChatMessage::new(
                Role::User,
                format!(
                    "The previous response did not match the required schema ({last_error}). \
                     Respond again with JSON that satisfies the schema exactly."
                ),
            ));
        }

        let value = client
            .complete_structured(request.clone(), schema_name, schema.clone())
            .await?;

        match serde_json::from_value::<T>(value) {
            Ok(parsed) => return Ok(parsed),
            Err(error) => {
                tracing::warn!(schema = schema_name, %error, attempt, "structured output failed validation");
                last_error = error.to_string();
            }
        }
    }

    Err(LlmError::SchemaViolation(format!(
        "{schema_name} failed validation after {MAX_SCHEMA_RETRIES} attempts: {last_error}"
    ))
    .into())
}

fn short_type_name<T>() -> &'static str {
    std::any::type_name::<T>()
        .rsplit("::")
        .next()
        .unwrap_or("Response")
}

/// Whether an HTTP status should be retried with backoff.
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Backoff delay for the given retry attempt, with jitter.
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    use rand::Rng as _;
    let base = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
    let jitter = rand::rng().random_range(0..RETRY_BASE_DELAY_MS);
    std::time::Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::RequireAgent;

    #[tokio::test]
    async fn structured_validates_and_parses() {
        let fake = FakeLlmClient::new();
        fake.push_structured(
            "RequireAgent",
            serde_json::json!({"complex_question": true, "context_rich_agent_request": "sum it"}),
        );
        let client: Arc<dyn LlmClientDyn> = Arc::new(fake);

        let request = CompletionRequest {
            caller: "router",
            model: "test-model".to_string(),
            temperature: 0.0,
            messages: vec![ChatMessage::new(Role::User, "hi")],
        };

        let parsed: RequireAgent = structured(&client, request).await.expect("parse");
        assert!(parsed.agent_required());
        assert_eq!(parsed.context_rich_agent_request, "sum it");
    }

    #[tokio::test]
    async fn schema_violations_retry_with_corrective_prompt() {
        let fake = FakeLlmClient::new();
        // First response has the wrong shape; second is valid.
        fake.push_structured("RequireAgent", serde_json::json!({"complex_question": "yes"}));
        fake.push_structured("RequireAgent", serde_json::json!({"complex_question": false}));
        let client: Arc<dyn LlmClientDyn> = Arc::new(fake);

        let request = CompletionRequest {
            caller: "router",
            model: "test-model".to_string(),
            temperature: 0.0,
            messages: vec![ChatMessage::new(Role::User, "hi")],
        };

        let parsed: RequireAgent = structured(&client, request).await.expect("parse");
        assert!(!parsed.agent_required());
    }

    #[test]
    fn retriable_statuses() {
        assert!(is_retriable_status(429));
        assert!(is_retriable_status(503));
        assert!(!is_retriable_status(401));
        assert!(!is_retriable_status(200));
    }
}
