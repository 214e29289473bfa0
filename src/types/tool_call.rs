//! Tool-call state tracked per streamed call.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Result, TurnstileError};

/// Lifecycle phase of a tool call.
///
/// Transitions between phases are defined by the table in
/// [`crate::processor::tool_calls`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ToolCallPhase {
    Streaming,
    InputComplete,
    ApprovalRequested,
    ApprovalResponded,
    OutputAvailable,
    OutputError,
}

impl ToolCallPhase {
    /// Whether no further transition is expected within this loop iteration.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ApprovalResponded | Self::OutputAvailable | Self::OutputError
        )
    }
}

/// Approval metadata attached to a gated tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalState {
    pub id: String,
    pub needs_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
}

/// A tool call as reconstructed from the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallState {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text. Only ever grows by concatenation.
    pub arguments: String,
    pub state: ToolCallPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallState {
    /// A freshly opened call in the `streaming` phase.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: String::new(),
            state: ToolCallPhase::Streaming,
            approval: None,
            output: None,
            error: None,
        }
    }

    pub fn append_arguments(&mut self, delta: &str) {
        self.arguments.push_str(delta);
    }

    /// Parse the accumulated arguments. Empty arguments parse as `{}`.
    pub fn parsed_arguments(&self) -> Result<serde_json::Value> {
        let raw = self.arguments.trim();
        if raw.is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_str(raw).map_err(|e| {
            TurnstileError::Parse(format!("tool {} arguments are not valid JSON: {e}", self.id))
        })
    }

    pub fn needs_approval(&self) -> bool {
        self.approval.as_ref().is_some_and(|a| a.needs_approval)
    }

    /// Terminal for auto-send purposes: approval answered, or an output is
    /// present on a call that required no approval.
    pub fn is_terminal(&self) -> bool {
        if self.state == ToolCallPhase::ApprovalResponded {
            return true;
        }
        if self.needs_approval() {
            return matches!(
                self.state,
                ToolCallPhase::OutputAvailable | ToolCallPhase::OutputError
            );
        }
        self.output.is_some() || self.state.is_terminal()
    }
}

/// Payload of an `approval-requested` custom event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    pub approval: ApprovalState,
}

/// Payload of a `tool-input-available` custom event: a client-side tool
/// whose input is complete and which the client is expected to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolInputRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}
