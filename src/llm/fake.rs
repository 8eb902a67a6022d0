//! Scripted LLM double for tests.
//!
//! Text responses pop from one queue; structured responses pop from a
//! per-schema queue, falling back to a sticky per-schema default when the
//! queue runs dry (retry loops call the same schema many times).

use crate::error::{LlmError, Result};
use crate::llm::{CompletionRequest, LlmClient};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct Script {
    text: VecDeque<String>,
    text_default: Option<String>,
    structured: HashMap<String, VecDeque<Value>>,
    structured_default: HashMap<String, Value>,
    calls: Vec<String>,
}

/// A scripted fake client.
#[derive(Default)]
pub struct FakeLlmClient {
    script: Mutex<Script>,
}

impl FakeLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next plain-completion response.
    pub fn push_text(&self, text: impl Into<String>) {
        self.script.lock().unwrap().text.push_back(text.into());
    }

    /// Sticky fallback once the text queue is empty.
    pub fn set_text_default(&self, text: impl Into<String>) {
        self.script.lock().unwrap().text_default = Some(text.into());
    }

    /// Queue the next structured response for a schema name.
    pub fn push_structured(&self, schema_name: &str, value: Value) {
        self.script
            .lock()
            .unwrap()
            .structured
            .entry(schema_name.to_string())
            .or_default()
            .push_back(value);
    }

    /// Sticky fallback for a schema once its queue is empty.
    pub fn set_structured_default(&self, schema_name: &str, value: Value) {
        self.script
            .lock()
            .unwrap()
            .structured_default
            .insert(schema_name.to_string(), value);
    }

    /// Ordered record of calls: "text" or the schema name.
    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }
}

impl LlmClient for FakeLlmClient {
    async fn complete(&self, _request: CompletionRequest) -> Result<String> {
        let mut script = self.script.lock().unwrap();
        script.calls.push("text".to_string());

        script
            .text
            .pop_front()
            .or_else(|| script.text_default.clone())
            .ok_or_else(|| LlmError::CompletionFailed("fake has no text response queued".into()).into())
    }

    async fn complete_structured(
        &self,
        _request: CompletionRequest,
        schema_name: &str,
        _schema: Value,
    ) -> Result<Value> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(schema_name.to_string());

        let queued = script
            .structured
            .get_mut(schema_name)
            .and_then(|queue| queue.pop_front());

        queued
            .or_else(|| script.structured_default.get(schema_name).cloned())
            .ok_or_else(|| {
                LlmError::CompletionFailed(format!(
                    "fake has no structured response queued for {schema_name}"
                ))
                .into()
            })
    }
}
