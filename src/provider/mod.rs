//! LLM providers: message types, the [`LlmClient`] capability trait, the
//! OpenAI-compatible HTTP client and the health-checked [`pool::ProviderPool`].
//!
//! Agent logic only ever sees the provider-agnostic types defined here; the
//! wire format lives in [`openai`].

pub mod openai;
pub mod pool;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ProviderError, Result};
use crate::models::ToolCall;

pub use pool::{HealthState, Lease, Outcome, PoolSettings, ProviderHealth, ProviderPool};

/// Role of a chat message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls requested by the assistant (only for `Role::Assistant`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool call id this message answers (only for `Role::Tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

pub fn system_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::System,
        content: content.to_string(),
        tool_calls: Vec::new(),
        tool_call_id: None,
    }
}

pub fn user_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::User,
        content: content.to_string(),
        tool_calls: Vec::new(),
        tool_call_id: None,
    }
}

/// Assistant turn carrying partial content and the calls it emitted.
pub fn assistant_message(content: &str, tool_calls: Vec<ToolCall>) -> ChatMessage {
    ChatMessage {
        role: Role::Assistant,
        content: content.to_string(),
        tool_calls,
        tool_call_id: None,
    }
}

pub fn tool_message(tool_call_id: &str, content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::Tool,
        content: content.to_string(),
        tool_calls: Vec::new(),
        tool_call_id: Some(tool_call_id.to_string()),
    }
}

/// A tool offered to the model, in function-calling form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

impl From<&crate::models::ToolDescriptor> for ToolDef {
    fn from(d: &crate::models::ToolDescriptor) -> Self {
        Self {
            name: d.qualified_name(),
            description: d.description.clone(),
            parameters: d.input_schema.clone(),
        }
    }
}

/// Sampling options for a generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub thinking: bool,
}

impl GenerateOptions {
    /// Reject out-of-range options before any request is made.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(Error::invalid(format!("temperature {} not in [0, 2]", t)));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::invalid(format!("top_p {} not in [0, 1]", p)));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(Error::invalid("max_tokens must be >= 1"));
        }
        Ok(())
    }
}

/// A finished (non-streamed or fully streamed) model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Tool calls in the order the model emitted them.
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

/// One item of a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatChunk {
    /// A content fragment.
    Delta(String),
    /// The assembled response. Always the last item of a successful stream.
    Done(Completion),
}

pub type ChatStream = BoxStream<'static, std::result::Result<ChatChunk, ProviderError>>;

/// Capability set of an LLM endpoint.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Entry name, used in logs and errors.
    fn name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> std::result::Result<Completion, ProviderError>;

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> std::result::Result<ChatStream, ProviderError>;

    /// Cheap liveness check used after a cooldown.
    async fn probe(&self) -> std::result::Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validation() {
        assert!(GenerateOptions::default().validate().is_ok());
        let bad_temp = GenerateOptions {
            temperature: Some(2.5),
            ..Default::default()
        };
        assert!(bad_temp.validate().is_err());
        let bad_top_p = GenerateOptions {
            top_p: Some(-0.1),
            ..Default::default()
        };
        assert!(bad_top_p.validate().is_err());
        let zero_tokens = GenerateOptions {
            max_tokens: Some(0),
            ..Default::default()
        };
        assert!(zero_tokens.validate().is_err());
        let edge = GenerateOptions {
            temperature: Some(2.0),
            top_p: Some(1.0),
            max_tokens: Some(1),
            ..Default::default()
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_tool_message_links_call_id() {
        let m = tool_message("call_1", "42");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call_1"));
    }
}
