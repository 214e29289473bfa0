//! Canonical chunk taxonomy consumed by the stream processor.

use serde::{Deserialize, Serialize};

use super::finish::FinishReason;
use super::usage::Usage;

/// Custom event name announcing that a client-side tool has its input ready.
pub const TOOL_INPUT_AVAILABLE: &str = "tool-input-available";

/// Custom event name announcing that a tool call awaits human approval.
pub const APPROVAL_REQUESTED: &str = "approval-requested";

/// One unit of the normalized stream.
///
/// The set is closed: every wire format is normalized into these variants
/// by [`crate::parser`] before reaching the processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ChunkEvent {
    /// Incremental assistant text.
    TextDelta {
        delta: String,
        /// Full text so far, when the server tracks it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accumulated: Option<String>,
    },
    /// A fragment of a tool call's JSON arguments, addressed by arrival slot.
    ToolCallDelta {
        index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        args_delta: String,
    },
    /// Explicit end of a tool call's argument stream.
    ToolCallEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<serde_json::Value>,
        /// Output of a tool the server already executed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl ChunkEvent {
    /// Shorthand for a text delta without server-side accumulation.
    pub fn text(delta: impl Into<String>) -> Self {
        Self::TextDelta {
            delta: delta.into(),
            accumulated: None,
        }
    }

    /// Shorthand for a tool-call argument fragment.
    pub fn tool_delta(index: u32, args_delta: impl Into<String>) -> Self {
        Self::ToolCallDelta {
            index,
            id: None,
            name: None,
            args_delta: args_delta.into(),
        }
    }

    /// Shorthand for the first fragment of a tool call, carrying its id and name.
    pub fn tool_start(
        index: u32,
        id: impl Into<String>,
        name: impl Into<String>,
        args_delta: impl Into<String>,
    ) -> Self {
        Self::ToolCallDelta {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            args_delta: args_delta.into(),
        }
    }

    /// Shorthand for a `done` chunk.
    pub fn done(finish_reason: FinishReason) -> Self {
        Self::Done {
            finish_reason: Some(finish_reason),
            usage: None,
        }
    }

    /// Wire name of this chunk kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text-delta",
            Self::ToolCallDelta { .. } => "tool-call-delta",
            Self::ToolCallEnd { .. } => "tool-call-end",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Custom { .. } => "custom",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_delta_uses_camel_case_fields() {
        let chunk: ChunkEvent = serde_json::from_str(
            r#"{"type":"tool-call-delta","index":1,"id":"call_1","name":"search","argsDelta":"{\"q\""}"#,
        )
        .unwrap();
        assert_eq!(chunk, ChunkEvent::tool_start(1, "call_1", "search", "{\"q\""));
    }

    #[test]
    fn done_parses_finish_reason_and_usage() {
        let chunk: ChunkEvent = serde_json::from_str(
            r#"{"type":"done","finishReason":"tool_calls","usage":{"promptTokens":3,"completionTokens":4,"totalTokens":7}}"#,
        )
        .unwrap();
        let ChunkEvent::Done { finish_reason, usage } = chunk else {
            panic!("expected done");
        };
        assert_eq!(finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn unknown_finish_reason_maps_to_other() {
        let chunk: ChunkEvent =
            serde_json::from_str(r#"{"type":"done","finishReason":"pause_turn"}"#).unwrap();
        assert_eq!(chunk, ChunkEvent::done(FinishReason::Other));
    }
}
