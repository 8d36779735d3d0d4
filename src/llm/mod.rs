//! Chat-completion transport for the hypothesis generators.
//!
//! The generators only need one capability: send an ordered list of chat
//! messages and get back the raw text, token usage and latency. That
//! capability is the [`LlmTransport`] trait. [`OpenAiClient`] implements it
//! against any OpenAI-compatible `/chat/completions` endpoint (a local Ollama
//! server by default); [`ScriptedTransport`] replays canned responses.
//!
//! The transport never touches the returned text. Fence stripping and JSON
//! parsing belong to the generators.

mod scripted;

use std::time::{Duration, Instant};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use scripted::{RecordedCall, ScriptedTransport};

/// Errors from the LLM transport.
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    #[error("LLM endpoint is not available at {url}")]
    #[diagnostic(
        code(causa::llm::unavailable),
        help("Start the model server (e.g. `ollama serve`) or point [llm].base_url at a running one.")
    )]
    Unavailable { url: String },

    #[error("LLM request failed: {message}")]
    #[diagnostic(
        code(causa::llm::request_failed),
        help("Check that the server is running and the model is pulled.")
    )]
    RequestFailed { message: String },

    #[error("failed to parse LLM response: {message}")]
    #[diagnostic(
        code(causa::llm::parse_error),
        help("The server returned something that is not an OpenAI-style chat completion.")
    )]
    ParseError { message: String },

    #[error("LLM request timed out after {timeout_secs}s")]
    #[diagnostic(
        code(causa::llm::timeout),
        help("Increase [llm].timeout_secs or use a smaller model.")
    )]
    Timeout { timeout_secs: u64 },
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// Connection settings for an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL up to and including the API version, e.g. `http://localhost:11434/v1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Bearer key. Local servers accept anything.
    #[serde(default = "default_api_key", skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".into()
}
fn default_model() -> String {
    "qwen2.5:14b".into()
}
fn default_api_key() -> String {
    "ollama".into()
}
fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: default_api_key(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user` or `assistant`.
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Token accounting reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// One completed chat call.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    /// Raw generated text, unmodified.
    pub text: String,
    /// `None` when the server did not report usage.
    pub usage: Option<Usage>,
    pub latency_s: f64,
}

impl LlmResponse {
    /// Usage as a JSON object, `{}` when absent.
    pub fn usage_json(&self) -> serde_json::Value {
        match self.usage {
            Some(u) => serde_json::to_value(u).unwrap_or_else(|_| serde_json::json!({})),
            None => serde_json::json!({}),
        }
    }
}

/// The chat capability the generators consume.
pub trait LlmTransport {
    fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> LlmResult<LlmResponse>;

    /// Model identifier, for metadata.
    fn model(&self) -> &str;

    /// Endpoint, for metadata.
    fn base_url(&self) -> &str;
}

// ── OpenAI-compatible client ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Blocking client for `POST {base_url}/chat/completions`.
pub struct OpenAiClient {
    config: LlmConfig,
    agent: ureq::Agent,
}

impl OpenAiClient {
    pub fn new(config: LlmConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self { config, agent }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn map_error(&self, err: ureq::Error) -> LlmError {
        match err {
            ureq::Error::Status(code, resp) => {
                let body = resp.into_string().unwrap_or_default();
                LlmError::RequestFailed {
                    message: format!("server returned status {code}: {}", body.trim()),
                }
            }
            ureq::Error::Transport(t) => {
                if is_timeout(&t) {
                    LlmError::Timeout {
                        timeout_secs: self.config.timeout_secs,
                    }
                } else if t.kind() == ureq::ErrorKind::ConnectionFailed {
                    LlmError::Unavailable {
                        url: self.config.base_url.clone(),
                    }
                } else {
                    LlmError::RequestFailed {
                        message: t.to_string(),
                    }
                }
            }
        }
    }
}

fn is_timeout(t: &ureq::Transport) -> bool {
    let mut source = std::error::Error::source(t);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

impl LlmTransport for OpenAiClient {
    fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> LlmResult<LlmResponse> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": temperature,
        });
        if let Some(n) = max_tokens {
            body["max_tokens"] = serde_json::Value::from(n);
        }

        tracing::debug!(model = %self.config.model, messages = messages.len(), temperature, "chat request");
        let t0 = Instant::now();
        let resp = self
            .agent
            .post(&self.endpoint())
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", self.config.api_key))
            .send_json(body)
            .map_err(|e| self.map_error(e))?;

        let resp_str = resp.into_string().map_err(|e| LlmError::ParseError {
            message: e.to_string(),
        })?;
        let latency_s = t0.elapsed().as_secs_f64();

        let parsed: CompletionBody =
            serde_json::from_str(&resp_str).map_err(|e| LlmError::ParseError {
                message: e.to_string(),
            })?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        tracing::debug!(latency_s, chars = text.len(), "chat response");
        Ok(LlmResponse {
            text,
            usage: parsed.usage,
            latency_s,
        })
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn base_url(&self) -> &str {
        &self.config.base_url
    }
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .field("timeout_secs", &self.config.timeout_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_endpoint_is_an_error() {
        let client = OpenAiClient::new(LlmConfig {
            base_url: "http://127.0.0.1:1/v1".into(),
            timeout_secs: 2,
            ..Default::default()
        });
        let result = client.chat(&[ChatMessage::user("hello")], 0.0, Some(8));
        assert!(matches!(
            result,
            Err(LlmError::Unavailable { .. } | LlmError::RequestFailed { .. })
        ));
    }

    #[test]
    fn default_config_values() {
        let config = LlmConfig::default();
        assert_eq!(config.base_url, "http://localhost:11434/v1");
        assert_eq!(config.api_key, "ollama");
        assert_eq!(config.timeout_secs, 120);
    }

    #[test]
    fn completion_body_without_usage() {
        let body: CompletionBody =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":"[]"}}]}"#)
                .unwrap();
        assert!(body.usage.is_none());
        assert_eq!(body.choices[0].message.content.as_deref(), Some("[]"));
    }

    #[test]
    fn usage_json_is_empty_object_when_absent() {
        let r = LlmResponse {
            text: String::new(),
            usage: None,
            latency_s: 0.0,
        };
        assert_eq!(r.usage_json(), serde_json::json!({}));
        let r = LlmResponse {
            usage: Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 4,
                total_tokens: 7,
            }),
            ..r
        };
        assert_eq!(r.usage_json()["total_tokens"], 7);
    }
}
