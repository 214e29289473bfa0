//! Message assembly.
//!
//! [`MessageList`] is a persistent value: every update returns a new list
//! and leaves `self` untouched. Messages are shared through `Arc`, so a
//! message the update did not touch is the same allocation in both lists.
//!
//! Within a message all tool-call parts precede all text parts. Updates
//! addressed by tool-call id or approval id search every message, not only
//! the latest, through id indexes kept beside the list.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, TurnstileError};
use crate::processor::{ProcessorEvent, Trigger};
use crate::types::{
    ApprovalState, Message, MessagePart, Role, ToolCallPhase, ToolCallState, ToolResultPart,
};

/// Ordered, copy-on-write message list.
#[derive(Debug, Clone, Default)]
pub struct MessageList {
    messages: Vec<Arc<Message>>,
    by_id: HashMap<String, usize>,
    by_tool_call: HashMap<String, usize>,
    by_approval: HashMap<String, usize>,
}

impl PartialEq for MessageList {
    fn eq(&self, other: &Self) -> bool {
        self.messages == other.messages
    }
}

impl FromIterator<Message> for MessageList {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self::from_shared(iter.into_iter().map(Arc::new).collect())
    }
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list from shared messages, indexing all of them.
    pub fn from_shared(messages: Vec<Arc<Message>>) -> Self {
        let mut list = Self {
            messages,
            ..Self::default()
        };
        for position in 0..list.messages.len() {
            list.index(position);
        }
        list
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn as_slice(&self) -> &[Arc<Message>] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Message>> {
        self.messages.iter()
    }

    pub fn get(&self, message_id: &str) -> Option<&Arc<Message>> {
        self.position(message_id).map(|p| &self.messages[p])
    }

    pub fn last(&self) -> Option<&Arc<Message>> {
        self.messages.last()
    }

    /// The most recent assistant message.
    pub fn last_assistant(&self) -> Option<&Arc<Message>> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    /// Find a tool call anywhere in the conversation.
    pub fn find_tool_call(&self, tool_call_id: &str) -> Option<&ToolCallState> {
        let position = self.locate_tool_call(tool_call_id)?;
        self.messages[position].tool_call(tool_call_id)
    }

    /// Append a message.
    pub fn push(&self, message: Message) -> Self {
        self.push_shared(Arc::new(message))
    }

    pub fn push_shared(&self, message: Arc<Message>) -> Self {
        let mut next = self.clone();
        next.messages.push(message);
        next.index(next.messages.len() - 1);
        next
    }

    /// Start a new assistant turn. Returns the new list and the message id.
    pub fn begin_assistant(&self) -> (Self, String) {
        let message = Message::assistant();
        let id = message.id.clone();
        (self.push(message), id)
    }

    /// Drop trailing assistant messages, leaving the conversation ready to be
    /// re-run from the last user turn.
    pub fn without_trailing_assistant(&self) -> Self {
        let keep = self
            .messages
            .iter()
            .rposition(|m| m.role != Role::Assistant)
            .map_or(0, |p| p + 1);
        Self::from_shared(self.messages[..keep].to_vec())
    }

    pub fn clear(&self) -> Self {
        Self::default()
    }

    /// Replace the message's text with `text`.
    ///
    /// Parts are rebuilt as tool calls, then any other parts, then one text
    /// part, so text always ends up last.
    pub fn update_text_part(&self, message_id: &str, text: &str) -> Self {
        self.map_message(message_id, |message| {
            let parts = std::mem::take(&mut message.parts);
            let (tool_calls, rest): (Vec<_>, Vec<_>) =
                parts.into_iter().partition(MessagePart::is_tool_call);
            message.parts = tool_calls
                .into_iter()
                .chain(rest.into_iter().filter(|p| !p.is_text()))
                .chain(std::iter::once(MessagePart::Text {
                    content: text.to_string(),
                }))
                .collect();
        })
    }

    /// Insert or replace a tool-call part.
    ///
    /// A new call goes immediately before the first text part; an existing
    /// call with the same id is replaced where it stands.
    pub fn upsert_tool_call_part(&self, message_id: &str, call: &ToolCallState) -> Self {
        self.upsert_tool_call(message_id, call, None)
    }

    /// Like [`upsert_tool_call_part`](Self::upsert_tool_call_part), but the
    /// part streamed so far under `previous_id` takes the call's new id.
    pub fn rename_tool_call_part(
        &self,
        message_id: &str,
        previous_id: &str,
        call: &ToolCallState,
    ) -> Self {
        let mut next = self.upsert_tool_call(message_id, call, Some(previous_id));
        next.by_tool_call.remove(previous_id);
        next
    }

    fn upsert_tool_call(
        &self,
        message_id: &str,
        call: &ToolCallState,
        previous_id: Option<&str>,
    ) -> Self {
        self.map_message(message_id, |message| {
            let matches = |id: &str| id == call.id || previous_id == Some(id);
            let existing = message.parts.iter_mut().find_map(|part| match part {
                MessagePart::ToolCall(current) if matches(&current.id) => Some(current),
                _ => None,
            });
            match existing {
                Some(current) => *current = call.clone(),
                None => {
                    let at = message
                        .parts
                        .iter()
                        .position(MessagePart::is_text)
                        .unwrap_or(message.parts.len());
                    message.parts.insert(at, MessagePart::ToolCall(call.clone()));
                }
            }
        })
    }

    /// Insert or replace the result part of a tool call.
    ///
    /// The result lands in the message that holds the tool call, falling
    /// back to `message_id` when the call is unknown.
    pub fn upsert_tool_result_part(&self, message_id: &str, result: ToolResultPart) -> Self {
        let Some(position) = self
            .locate_tool_call(&result.tool_call_id)
            .or_else(|| self.position(message_id))
        else {
            tracing::debug!(message_id, "tool result for unknown message");
            return self.clone();
        };
        self.replace_at(position, |message| {
            let existing = message.parts.iter_mut().find_map(|part| match part {
                MessagePart::ToolResult(current) if current.tool_call_id == result.tool_call_id => {
                    Some(current)
                }
                _ => None,
            });
            match existing {
                Some(current) => *current = result,
                None => message.parts.push(MessagePart::ToolResult(result)),
            }
        })
    }

    /// Mark a tool call as awaiting approval.
    pub fn update_tool_call_approval(&self, tool_call_id: &str, approval_id: &str) -> Result<Self> {
        self.try_map_tool_call(tool_call_id, |call| {
            if call.state != ToolCallPhase::ApprovalRequested {
                call.apply(Trigger::RequestApproval)?;
            }
            call.approval = Some(ApprovalState {
                id: approval_id.to_string(),
                needs_approval: true,
                approved: None,
            });
            Ok(())
        })
    }

    /// Record the human decision for an approval.
    pub fn update_tool_call_approval_response(
        &self,
        approval_id: &str,
        approved: bool,
    ) -> Result<Self> {
        let tool_call_id = self
            .locate_approval(approval_id)
            .and_then(|position| {
                self.messages[position]
                    .tool_calls()
                    .find(|c| c.approval.as_ref().is_some_and(|a| a.id == approval_id))
                    .map(|c| c.id.clone())
            })
            .ok_or_else(|| {
                TurnstileError::InvalidState(format!("unknown approval id: {approval_id}"))
            })?;

        self.try_map_tool_call(&tool_call_id, |call| {
            call.apply(Trigger::RespondApproval)?;
            if let Some(approval) = call.approval.as_mut() {
                approval.approved = Some(approved);
            }
            Ok(())
        })
    }

    /// Attach a tool output, or an error when `error` is set.
    pub fn update_tool_call_with_output(
        &self,
        tool_call_id: &str,
        output: Value,
        error: Option<String>,
    ) -> Result<Self> {
        self.try_map_tool_call(tool_call_id, |call| {
            // A client tool can answer before its argument stream was closed.
            call.complete_if_streaming(Trigger::ExplicitEnd);
            match error {
                Some(message) => {
                    call.apply(Trigger::FailOutput)?;
                    call.error = Some(message);
                }
                None => {
                    call.apply(Trigger::ProvideOutput)?;
                }
            }
            call.output = Some(output);
            Ok(())
        })
    }

    /// Apply one processor event to the message it belongs to.
    pub fn apply(&self, message_id: &str, event: &ProcessorEvent) -> Self {
        match event {
            ProcessorEvent::TextUpdate { text } => self.update_text_part(message_id, text),
            ProcessorEvent::ToolCallStateChange {
                call,
                previous_id: Some(previous_id),
                ..
            } => self.rename_tool_call_part(message_id, previous_id, call),
            ProcessorEvent::ToolCallStateChange { call, .. } => {
                self.upsert_tool_call_part(message_id, call)
            }
            ProcessorEvent::ToolResultStateChange {
                tool_call_id,
                content,
                state,
                error,
            } => self.upsert_tool_result_part(
                message_id,
                ToolResultPart {
                    tool_call_id: tool_call_id.clone(),
                    content: content.clone(),
                    state: *state,
                    error: error.clone(),
                },
            ),
            ProcessorEvent::ApprovalRequested(request) => {
                let already = self
                    .find_tool_call(&request.tool_call_id)
                    .and_then(|c| c.approval.as_ref())
                    .is_some_and(|a| a.id == request.approval.id);
                if already {
                    return self.clone();
                }
                self.update_tool_call_approval(&request.tool_call_id, &request.approval.id)
                    .unwrap_or_else(|err| {
                        tracing::warn!(error = %err, "could not record approval request");
                        self.clone()
                    })
            }
            _ => self.clone(),
        }
    }

    fn position(&self, message_id: &str) -> Option<usize> {
        self.by_id
            .get(message_id)
            .copied()
            .filter(|p| self.messages.get(*p).is_some_and(|m| m.id == message_id))
            .or_else(|| self.messages.iter().rposition(|m| m.id == message_id))
    }

    fn locate_tool_call(&self, tool_call_id: &str) -> Option<usize> {
        self.by_tool_call
            .get(tool_call_id)
            .copied()
            .filter(|p| {
                self.messages
                    .get(*p)
                    .is_some_and(|m| m.tool_call(tool_call_id).is_some())
            })
            .or_else(|| {
                self.messages
                    .iter()
                    .rposition(|m| m.tool_call(tool_call_id).is_some())
            })
    }

    fn locate_approval(&self, approval_id: &str) -> Option<usize> {
        let holds = |m: &Arc<Message>| {
            m.tool_calls()
                .any(|c| c.approval.as_ref().is_some_and(|a| a.id == approval_id))
        };
        self.by_approval
            .get(approval_id)
            .copied()
            .filter(|p| self.messages.get(*p).is_some_and(|m| holds(m)))
            .or_else(|| self.messages.iter().rposition(|m| holds(m)))
    }

    fn index(&mut self, position: usize) {
        let message = &self.messages[position];
        self.by_id.insert(message.id.clone(), position);
        for call in message.tool_calls() {
            self.by_tool_call.insert(call.id.clone(), position);
            if let Some(approval) = &call.approval {
                self.by_approval.insert(approval.id.clone(), position);
            }
        }
    }

    fn map_message<F>(&self, message_id: &str, f: F) -> Self
    where
        F: FnOnce(&mut Message),
    {
        match self.position(message_id) {
            Some(position) => self.replace_at(position, f),
            None => {
                tracing::debug!(message_id, "update for unknown message");
                self.clone()
            }
        }
    }

    fn replace_at<F>(&self, position: usize, f: F) -> Self
    where
        F: FnOnce(&mut Message),
    {
        let mut message = Message::clone(&self.messages[position]);
        f(&mut message);
        let mut next = self.clone();
        next.messages[position] = Arc::new(message);
        next.index(position);
        next
    }

    fn try_map_tool_call<F>(&self, tool_call_id: &str, f: F) -> Result<Self>
    where
        F: FnOnce(&mut ToolCallState) -> Result<()>,
    {
        let position = self.locate_tool_call(tool_call_id).ok_or_else(|| {
            TurnstileError::InvalidState(format!("unknown tool call id: {tool_call_id}"))
        })?;

        let mut message = Message::clone(&self.messages[position]);
        let call = message
            .parts
            .iter_mut()
            .find_map(|part| match part {
                MessagePart::ToolCall(call) if call.id == tool_call_id => Some(call),
                _ => None,
            })
            .ok_or_else(|| {
                TurnstileError::InvalidState(format!("unknown tool call id: {tool_call_id}"))
            })?;
        if let Err(err) = f(call) {
            tracing::warn!(tool_call_id, error = %err, "rejected tool call update");
            return Err(err);
        }

        let mut next = self.clone();
        next.messages[position] = Arc::new(message);
        next.index(position);
        Ok(next)
    }
}

/// Whether every tool call of the latest assistant message is terminal.
///
/// False when that message has no tool calls at all, so a plain text turn
/// never triggers another request.
pub fn should_auto_send(messages: &MessageList) -> bool {
    let Some(message) = messages.last_assistant() else {
        return false;
    };
    let mut calls = message.tool_calls().peekable();
    calls.peek().is_some() && calls.all(ToolCallState::is_terminal)
}
