//! Normalization of decoded JSON payloads into the canonical taxonomy.
//!
//! Canonical payloads (`{"type":"text-delta",...}`) deserialize directly.
//! AG-UI protocol events (`{"type":"TEXT_MESSAGE_CONTENT",...}`) are mapped
//! onto the same variants; tool-call arguments in AG-UI are addressed by id,
//! so the normalizer remembers which slot index each id opened.

use std::collections::HashMap;

use serde_json::Value;

use crate::types::{ChunkEvent, FinishReason, Usage};

/// Stateful, per-stream payload normalizer.
#[derive(Debug, Default)]
pub struct ChunkNormalizer {
    slots: HashMap<String, u32>,
    next_index: u32,
}

impl ChunkNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map one payload to a chunk, or `None` when it carries nothing the
    /// processor consumes. Malformed payloads are logged and dropped.
    pub fn normalize(&mut self, value: Value) -> Option<ChunkEvent> {
        let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            tracing::warn!(payload = %value, "skipping chunk without a type");
            return None;
        };

        if is_ag_ui(&kind) {
            return self.normalize_ag_ui(&kind, &value);
        }

        match serde_json::from_value::<ChunkEvent>(value) {
            Ok(chunk) => Some(chunk),
            Err(err) => {
                tracing::debug!(kind, error = %err, "ignoring unrecognized chunk");
                None
            }
        }
    }

    fn normalize_ag_ui(&mut self, kind: &str, value: &Value) -> Option<ChunkEvent> {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
        match kind {
            "TEXT_MESSAGE_CONTENT" => Some(ChunkEvent::TextDelta {
                delta: text("delta").unwrap_or_default(),
                accumulated: text("content"),
            }),
            "TOOL_CALL_START" => {
                let id = text("toolCallId")?;
                let index = value
                    .get("index")
                    .and_then(Value::as_u64)
                    .and_then(|i| u32::try_from(i).ok())
                    .unwrap_or(self.next_index);
                self.slots.insert(id.clone(), index);
                self.next_index = self.next_index.max(index.saturating_add(1));
                Some(ChunkEvent::ToolCallDelta {
                    index,
                    id: Some(id),
                    name: text("toolName"),
                    args_delta: String::new(),
                })
            }
            "TOOL_CALL_ARGS" => {
                let id = text("toolCallId")?;
                let index = self.slot_for(&id);
                Some(ChunkEvent::ToolCallDelta {
                    index,
                    id: Some(id),
                    name: None,
                    args_delta: text("delta").unwrap_or_default(),
                })
            }
            "TOOL_CALL_END" => Some(ChunkEvent::ToolCallEnd {
                id: text("toolCallId")?,
                input: value.get("input").filter(|v| !v.is_null()).cloned(),
                result: text("result"),
            }),
            "RUN_FINISHED" => Some(ChunkEvent::Done {
                finish_reason: value
                    .get("finishReason")
                    .and_then(|v| serde_json::from_value::<FinishReason>(v.clone()).ok()),
                usage: value
                    .get("usage")
                    .and_then(|v| serde_json::from_value::<Usage>(v.clone()).ok()),
            }),
            "RUN_ERROR" => {
                let error = value.get("error");
                let field = |key: &str| {
                    error
                        .and_then(|e| e.get(key))
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                };
                Some(ChunkEvent::Error {
                    message: field("message").unwrap_or_else(|| "unknown error".to_string()),
                    code: field("code"),
                })
            }
            "CUSTOM" => Some(ChunkEvent::Custom {
                name: text("name")?,
                data: value.get("data").cloned().unwrap_or(Value::Null),
            }),
            other => {
                tracing::debug!(kind = other, "dropping lifecycle event");
                None
            }
        }
    }

    fn slot_for(&mut self, id: &str) -> u32 {
        if let Some(index) = self.slots.get(id) {
            return *index;
        }
        let index = self.next_index;
        self.next_index = index.saturating_add(1);
        self.slots.insert(id.to_string(), index);
        index
    }
}

fn is_ag_ui(kind: &str) -> bool {
    kind.chars().all(|c| c.is_ascii_uppercase() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_payloads_pass_through() {
        let mut normalizer = ChunkNormalizer::new();
        let chunk = normalizer.normalize(json!({"type": "text-delta", "delta": "Hi"}));
        assert_eq!(chunk, Some(ChunkEvent::text("Hi")));
    }

    #[test]
    fn unknown_canonical_kind_is_dropped() {
        let mut normalizer = ChunkNormalizer::new();
        assert_eq!(normalizer.normalize(json!({"type": "reasoning-delta"})), None);
        assert_eq!(normalizer.normalize(json!({"delta": "no type"})), None);
    }

    #[test]
    fn ag_ui_tool_args_follow_their_start_slot() {
        let mut normalizer = ChunkNormalizer::new();
        let start_a = normalizer.normalize(json!({
            "type": "TOOL_CALL_START", "toolCallId": "a", "toolName": "search"
        }));
        let start_b = normalizer.normalize(json!({
            "type": "TOOL_CALL_START", "toolCallId": "b", "toolName": "fetch"
        }));
        let args_a = normalizer.normalize(json!({
            "type": "TOOL_CALL_ARGS", "toolCallId": "a", "delta": "{}"
        }));

        assert!(matches!(start_a, Some(ChunkEvent::ToolCallDelta { index: 0, .. })));
        assert!(matches!(start_b, Some(ChunkEvent::ToolCallDelta { index: 1, .. })));
        assert_eq!(
            args_a,
            Some(ChunkEvent::ToolCallDelta {
                index: 0,
                id: Some("a".into()),
                name: None,
                args_delta: "{}".into(),
            })
        );
    }

    #[test]
    fn highest_slot_index_does_not_overflow() {
        let mut normalizer = ChunkNormalizer::new();
        let start = normalizer.normalize(json!({
            "type": "TOOL_CALL_START", "toolCallId": "a", "toolName": "search", "index": u32::MAX
        }));
        let args = normalizer.normalize(json!({
            "type": "TOOL_CALL_ARGS", "toolCallId": "b", "delta": "{}"
        }));
        let more = normalizer.normalize(json!({
            "type": "TOOL_CALL_ARGS", "toolCallId": "c", "delta": "{}"
        }));

        assert!(matches!(start, Some(ChunkEvent::ToolCallDelta { index: u32::MAX, .. })));
        assert!(matches!(args, Some(ChunkEvent::ToolCallDelta { index: u32::MAX, .. })));
        assert!(matches!(more, Some(ChunkEvent::ToolCallDelta { index: u32::MAX, .. })));
    }

    #[test]
    fn ag_ui_run_events_map_to_done_and_error() {
        let mut normalizer = ChunkNormalizer::new();
        assert_eq!(
            normalizer.normalize(json!({"type": "RUN_FINISHED", "finishReason": "stop"})),
            Some(ChunkEvent::done(FinishReason::Stop))
        );
        assert_eq!(
            normalizer.normalize(json!({
                "type": "RUN_ERROR", "error": {"message": "boom", "code": "500"}
            })),
            Some(ChunkEvent::Error {
                message: "boom".into(),
                code: Some("500".into()),
            })
        );
        assert_eq!(normalizer.normalize(json!({"type": "RUN_STARTED"})), None);
    }
}
