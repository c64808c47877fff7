//! Scripted LLM client for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::openrouter::{Completion, LlmClient, LlmError, Message};

/// A structured call as seen by the client.
#[derive(Debug, Clone)]
pub struct StructuredCall {
    pub messages: Vec<Message>,
    pub schema_name: String,
    pub schema: serde_json::Value,
}

/// Replays queued replies in order and records every request.
/// An exhausted queue answers with [`LlmError::EmptyResponse`]. Structured replies
/// are taken in call order and may be held back for a while before returning.
#[derive(Default)]
pub struct ScriptedLlm {
    chat_replies: Mutex<VecDeque<Result<Completion, LlmError>>>,
    structured_replies: Mutex<VecDeque<(Duration, Result<String, LlmError>)>>,
    pub chat_calls: Mutex<Vec<Vec<Message>>>,
    pub structured_calls: Mutex<Vec<StructuredCall>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.chat_replies.lock().unwrap().push_back(Ok(Completion {
            content: text.to_string(),
            sources: Vec::new(),
        }));
        self
    }

    pub fn reply_with(self, result: Result<Completion, LlmError>) -> Self {
        self.chat_replies.lock().unwrap().push_back(result);
        self
    }

    pub fn extract(self, raw: &str) -> Self {
        self.extract_with(Ok(raw.to_string()))
    }

    /// Queue a structured reply that arrives only after `delay`.
    pub fn extract_after(self, raw: &str, delay: Duration) -> Self {
        self.structured_replies
            .lock()
            .unwrap()
            .push_back((delay, Ok(raw.to_string())));
        self
    }

    pub fn extract_with(self, result: Result<String, LlmError>) -> Self {
        self.structured_replies
            .lock()
            .unwrap()
            .push_back((Duration::ZERO, result));
        self
    }

    pub fn chat_call_count(&self) -> usize {
        self.chat_calls.lock().unwrap().len()
    }

    pub fn structured_call_count(&self) -> usize {
        self.structured_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, messages: Vec<Message>) -> Result<Completion, LlmError> {
        self.chat_calls.lock().unwrap().push(messages);
        self.chat_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }

    async fn complete_structured(
        &self,
        messages: Vec<Message>,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<String, LlmError> {
        self.structured_calls.lock().unwrap().push(StructuredCall {
            messages,
            schema_name: schema_name.to_string(),
            schema,
        });
        let next = self.structured_replies.lock().unwrap().pop_front();
        let (delay, result) = next.unwrap_or((Duration::ZERO, Err(LlmError::EmptyResponse)));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}
