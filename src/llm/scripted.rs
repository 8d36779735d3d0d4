//! Replay transport: returns queued responses in order and records each call.

use std::cell::RefCell;
use std::collections::VecDeque;

use super::{ChatMessage, LlmError, LlmResponse, LlmResult, LlmTransport, Usage};

/// One call seen by a [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

/// Transport that replays canned texts. Running out of script is a
/// `RequestFailed` error.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: RefCell<VecDeque<LlmResult<String>>>,
    calls: RefCell<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn push_text(&self, text: impl Into<String>) -> &Self {
        self.script.borrow_mut().push_back(Ok(text.into()));
        self
    }

    /// Queue a transport failure.
    pub fn push_error(&self, error: LlmError) -> &Self {
        self.script.borrow_mut().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }

    pub fn remaining(&self) -> usize {
        self.script.borrow().len()
    }
}

impl LlmTransport for ScriptedTransport {
    fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> LlmResult<LlmResponse> {
        self.calls.borrow_mut().push(RecordedCall {
            messages: messages.to_vec(),
            temperature,
            max_tokens,
        });
        let next = self
            .script
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| {
                Err(LlmError::RequestFailed {
                    message: "script exhausted".into(),
                })
            })?;
        let prompt_tokens = messages.iter().map(|m| m.content.len() as u64 / 4).sum();
        let completion_tokens = next.len() as u64 / 4;
        Ok(LlmResponse {
            text: next,
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
            latency_s: 0.0,
        })
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn base_url(&self) -> &str {
        "scripted://"
    }
}
