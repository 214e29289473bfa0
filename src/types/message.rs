//! UI message model assembled from the stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::tool_call::ToolCallState;

/// Generate a prefixed unique id, e.g. `msg-3f1c…`.
pub fn generate_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl Message {
    /// Create an empty message with a fresh id.
    pub fn new(role: Role) -> Self {
        Self {
            id: generate_id("msg"),
            role,
            created_at: Utc::now(),
            parts: Vec::new(),
        }
    }

    /// Create a user message with a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        let mut message = Self::new(Role::User);
        message.parts.push(MessagePart::Text {
            content: text.into(),
        });
        message
    }

    /// Create an empty assistant message, the start of a new turn.
    pub fn assistant() -> Self {
        Self::new(Role::Assistant)
    }

    /// Concatenate all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Tool-call parts in order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallState> {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_call(&self, tool_call_id: &str) -> Option<&ToolCallState> {
        self.tool_calls().find(|call| call.id == tool_call_id)
    }

    /// Tool-result parts in order.
    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResultPart> {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::ToolResult(result) => Some(result),
            _ => None,
        })
    }
}

/// Conversation role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single part of message content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text { content: String },
    ToolCall(ToolCallState),
    ToolResult(ToolResultPart),
}

impl MessagePart {
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, Self::ToolCall(_))
    }
}

/// Progress of a tool result part.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ToolResultState {
    Streaming,
    Complete,
    Error,
}

/// The result of a tool call, rendered as its own part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPart {
    pub tool_call_id: String,
    pub content: String,
    pub state: ToolResultState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
