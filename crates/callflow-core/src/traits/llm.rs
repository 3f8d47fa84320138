//! LLM adapter contract and chat wire types.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Chat participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Part of a multimodal user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// One entry of a conversation scope's message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    /// Multimodal parts; empty for plain text messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,
    /// Tool invocations issued by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool-role messages answering a specific call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }

    /// User message with multimodal parts (text and/or image).
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            parts,
            ..Self::plain(Role::User, "")
        }
    }

    /// Assistant message that carries tool invocations instead of text.
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, "")
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            parts: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Concatenated textual content, used by the token estimator.
    pub fn text_content(&self) -> String {
        if self.parts.is_empty() {
            return self.content.clone();
        }
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(text);
            }
        }
        out
    }
}

/// A tool exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object.
    #[serde(default)]
    pub schema: serde_json::Value,
    /// When set, the user must confirm before the call is dispatched.
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub confirmation_prompt_by_language: HashMap<String, String>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::Value::Null,
            requires_confirmation: false,
            confirmation_prompt: None,
            confirmation_prompt_by_language: HashMap::new(),
        }
    }
}

/// A tool invocation returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// The full request context handed to an adapter.
#[derive(Debug, Clone, Default)]
pub struct LlmContext {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Adapter response to a non-streaming generation.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    /// Requests switching the active agent, preserving history.
    pub handoff_agent: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
}

/// Streamed completion tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Vendor LLM adapter.
///
/// Rate-limit failures must surface as the rate-limit error kind so circuit
/// breakers and reason-code mapping recognize them. Callers own deadlines:
/// generation is wrapped in the per-call context by the pipeline.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, input: LlmContext) -> Result<LlmResponse>;

    async fn stream(&self, input: LlmContext) -> Result<TokenStream>;
}

/// Registry of executable tool handlers, implemented by the application.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn tools(&self) -> Vec<ToolSpec>;

    async fn handle_tool(&self, name: &str, args: serde_json::Value) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builders_set_roles() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        let t = ChatMessage::tool("ok", "call-1");
        assert_eq!(t.role, Role::Tool);
        assert_eq!(t.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn text_content_joins_text_parts() {
        let msg = ChatMessage::user_parts(vec![
            ContentPart::Text { text: "lihat".into() },
            ContentPart::ImageUrl {
                url: "https://example.com/a.png".into(),
            },
            ContentPart::Text { text: "ini".into() },
        ]);
        assert_eq!(msg.text_content(), "lihat ini");
    }

    #[test]
    fn chat_message_roundtrips_json() {
        let msg = ChatMessage::assistant_tool_calls(vec![ToolCall {
            id: "c1".into(),
            name: "schedule_visit".into(),
            arguments: serde_json::json!({"date": "2025-01-01"}),
        }]);
        let raw = serde_json::to_string(&msg).unwrap();
        let back: ChatMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.tool_calls[0].name, "schedule_visit");
    }
}
