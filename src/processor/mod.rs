//! Stream processing: one ordered chunk sequence in, high-level events out.
//!
//! A [`StreamProcessor`] is an owned session object built fresh for every
//! connect cycle. It routes text deltas through a [`ChunkStrategy`] and
//! tool-call deltas through a [`ToolCallTracker`], and reports everything it
//! learns to a [`ProcessorSink`] in arrival order.

pub mod tool_calls;

pub use tool_calls::{next_phase, ToolCallChange, ToolCallTracker, Trigger};

use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TurnstileError};
use crate::strategy::{ChunkStrategy, Immediate};
use crate::types::{
    ApprovalRequest, ChunkEvent, FinishReason, ToolCallPhase, ToolCallState, ToolInputRequest,
    ToolResultState, Usage, APPROVAL_REQUESTED, TOOL_INPUT_AVAILABLE,
};

/// Callback surface of the processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorEvent {
    /// Full accumulated text, not just the latest delta.
    TextUpdate { text: String },
    ToolCallStateChange {
        index: u32,
        call: ToolCallState,
        /// Set once, when a placeholder id is replaced by the real one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_id: Option<String>,
    },
    ToolResultStateChange {
        tool_call_id: String,
        content: String,
        state: ToolResultState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ApprovalRequested(ApprovalRequest),
    ToolInputAvailable(ToolInputRequest),
    StreamEnd(StreamSummary),
    /// An `error` chunk sent by the server.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// A custom event with a name the processor does not intercept.
    Custom {
        name: String,
        data: serde_json::Value,
    },
}

impl From<ToolCallChange> for ProcessorEvent {
    fn from(change: ToolCallChange) -> Self {
        Self::ToolCallStateChange {
            index: change.index,
            call: change.call,
            previous_id: change.previous_id,
        }
    }
}

/// Receiver of processor events.
pub trait ProcessorSink {
    fn emit(&mut self, event: ProcessorEvent);
}

impl<F> ProcessorSink for F
where
    F: FnMut(ProcessorEvent),
{
    fn emit(&mut self, event: ProcessorEvent) {
        self(event)
    }
}

/// Final state of a processed stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub text: String,
    pub tool_calls: Vec<ToolCallState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// How [`StreamProcessor::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(StreamSummary),
    /// The cancellation token fired. Everything emitted so far stands.
    Cancelled,
}

/// Per-cycle stream reconciliation session.
pub struct StreamProcessor {
    strategy: Box<dyn ChunkStrategy>,
    text: String,
    pending: String,
    dirty: bool,
    tracker: ToolCallTracker,
    summary: Option<StreamSummary>,
    idle_timeout: Option<Duration>,
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new(Box::new(Immediate))
    }
}

impl std::fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("text_len", &self.text.len())
            .field("pending_len", &self.pending.len())
            .field("tracker", &self.tracker)
            .field("finished", &self.summary.is_some())
            .finish()
    }
}

impl StreamProcessor {
    pub fn new(mut strategy: Box<dyn ChunkStrategy>) -> Self {
        strategy.reset();
        Self {
            strategy,
            text: String::new(),
            pending: String::new(),
            dirty: false,
            tracker: ToolCallTracker::new(),
            summary: None,
            idle_timeout: None,
        }
    }

    /// Fail [`run`](Self::run) with [`TurnstileError::Timeout`] when no chunk
    /// arrives for this long.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// Accumulated text so far, including text not yet surfaced.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Tool calls in arrival order.
    pub fn tool_calls(&self) -> Vec<ToolCallState> {
        self.tracker.calls()
    }

    pub fn is_finished(&self) -> bool {
        self.summary.is_some()
    }

    /// Process one chunk.
    ///
    /// An `error` chunk is reported to the sink and then returned as
    /// [`TurnstileError::Stream`]; pending text is flushed first so nothing
    /// already received is lost.
    pub fn process<S>(&mut self, chunk: ChunkEvent, sink: &mut S) -> Result<()>
    where
        S: ProcessorSink + ?Sized,
    {
        if self.summary.is_some() {
            tracing::debug!(kind = chunk.kind(), "ignoring chunk after stream end");
            return Ok(());
        }

        match chunk {
            ChunkEvent::TextDelta { delta, accumulated } => {
                self.on_text(&delta, accumulated, sink);
            }
            ChunkEvent::ToolCallDelta {
                index,
                id,
                name,
                args_delta,
            } => {
                let changes =
                    self.tracker
                        .apply_delta(index, id.as_deref(), name.as_deref(), &args_delta);
                emit_changes(changes, sink);
            }
            ChunkEvent::ToolCallEnd { id, input, result } => {
                self.on_tool_call_end(&id, input, result, sink);
            }
            ChunkEvent::Done {
                finish_reason,
                usage,
            } => {
                self.finish(finish_reason, usage, sink);
            }
            ChunkEvent::Error { message, code } => {
                self.flush_pending(sink);
                sink.emit(ProcessorEvent::Error {
                    message: message.clone(),
                    code: code.clone(),
                });
                return Err(TurnstileError::stream(message, code));
            }
            ChunkEvent::Custom { name, data } => self.on_custom(name, data, sink),
        }
        Ok(())
    }

    /// Surface pending text regardless of strategy.
    pub fn flush_pending<S>(&mut self, sink: &mut S)
    where
        S: ProcessorSink + ?Sized,
    {
        if !self.dirty {
            return;
        }
        self.pending.clear();
        self.dirty = false;
        sink.emit(ProcessorEvent::TextUpdate {
            text: self.text.clone(),
        });
    }

    /// Flush driven by the strategy's timer.
    pub fn flush_timer<S>(&mut self, sink: &mut S)
    where
        S: ProcessorSink + ?Sized,
    {
        self.strategy.on_timer_flush();
        self.flush_pending(sink);
    }

    /// End the stream: flush text, force-complete open tool calls and emit
    /// [`ProcessorEvent::StreamEnd`]. Later calls return the same summary.
    pub fn finish<S>(
        &mut self,
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
        sink: &mut S,
    ) -> StreamSummary
    where
        S: ProcessorSink + ?Sized,
    {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }
        self.flush_pending(sink);
        let changes = self.tracker.complete_all(Trigger::StreamDone);
        emit_changes(changes, sink);

        let summary = StreamSummary {
            text: self.text.clone(),
            tool_calls: self.tracker.calls(),
            finish_reason,
            usage,
        };
        tracing::debug!(
            text_len = summary.text.len(),
            tool_calls = summary.tool_calls.len(),
            finish_reason = ?summary.finish_reason,
            "stream finished"
        );
        sink.emit(ProcessorEvent::StreamEnd(summary.clone()));
        self.summary = Some(summary.clone());
        self.strategy.reset();
        summary
    }

    /// Drive the processor over a chunk stream until it ends, fails, idles
    /// out or `cancel` fires.
    ///
    /// A stream that ends without a `done` chunk is finalized as if one had
    /// arrived with no finish reason. Timer-driven strategies are flushed
    /// here once their quiet period elapses.
    pub async fn run<St, S>(
        &mut self,
        stream: St,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome>
    where
        St: Stream<Item = Result<ChunkEvent>>,
        S: ProcessorSink + ?Sized,
    {
        let mut stream = std::pin::pin!(stream);
        let idle_timeout = self.idle_timeout;
        let mut idle_deadline = idle_timeout.map(|t| Instant::now() + t);
        let mut flush_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.flush_pending(sink);
                    tracing::debug!(text_len = self.text.len(), "stream cancelled");
                    return Ok(StreamOutcome::Cancelled);
                }
                _ = sleep_until_or_pending(flush_deadline) => {
                    flush_deadline = None;
                    self.flush_timer(sink);
                }
                _ = sleep_until_or_pending(idle_deadline) => {
                    self.flush_pending(sink);
                    let ms = idle_timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                    tracing::warn!(timeout_ms = ms, "stream idle timeout");
                    return Err(TurnstileError::Timeout(ms));
                }
                item = stream.next() => {
                    let Some(item) = item else { break; };
                    let chunk = match item {
                        Ok(chunk) => chunk,
                        Err(err) => {
                            self.flush_pending(sink);
                            return Err(err);
                        }
                    };
                    idle_deadline = idle_timeout.map(|t| Instant::now() + t);
                    let is_text = matches!(chunk, ChunkEvent::TextDelta { .. });
                    self.process(chunk, sink)?;
                    if self.summary.is_some() {
                        break;
                    }
                    if is_text {
                        flush_deadline = self
                            .strategy
                            .flush_after()
                            .map(|delay| Instant::now() + delay);
                    }
                }
            }
        }

        Ok(StreamOutcome::Completed(self.finish(None, None, sink)))
    }

    fn on_text<S>(&mut self, delta: &str, accumulated: Option<String>, sink: &mut S)
    where
        S: ProcessorSink + ?Sized,
    {
        let changes = self.tracker.complete_all(Trigger::TextArrived);
        emit_changes(changes, sink);

        match accumulated {
            Some(full) => self.text = full,
            None => self.text.push_str(delta),
        }
        self.pending.push_str(delta);
        self.dirty = true;

        if self.strategy.should_emit(delta, &self.text) {
            self.flush_pending(sink);
        }
    }

    fn on_tool_call_end<S>(
        &mut self,
        id: &str,
        input: Option<serde_json::Value>,
        result: Option<String>,
        sink: &mut S,
    ) where
        S: ProcessorSink + ?Sized,
    {
        self.resolve_id(id, sink);
        if self.tracker.get(id).is_none() {
            tracing::debug!(tool_call_id = id, "end signal for unknown tool call");
            return;
        }

        if let Some(input) = input {
            self.tracker.update(id, |call| {
                if call.arguments.is_empty() {
                    call.arguments = input.to_string();
                }
            });
        }
        if let Some(change) = self.tracker.end(id) {
            sink.emit(change.into());
        }

        let Some(content) = result else {
            return;
        };
        let change = self.tracker.update(id, |call| match call.apply(Trigger::ProvideOutput) {
            Ok(_) => {
                call.output = Some(
                    serde_json::from_str(&content)
                        .unwrap_or_else(|_| serde_json::Value::String(content.clone())),
                );
            }
            Err(err) => tracing::warn!(error = %err, "discarding server tool result"),
        });
        if let Some(change) = change.filter(|c| c.call.state == ToolCallPhase::OutputAvailable) {
            sink.emit(change.into());
            sink.emit(ProcessorEvent::ToolResultStateChange {
                tool_call_id: id.to_string(),
                content,
                state: ToolResultState::Complete,
                error: None,
            });
        }
    }

    /// Signals addressed by id may carry the real id of a call that has
    /// only streamed under a placeholder so far.
    fn resolve_id<S>(&mut self, id: &str, sink: &mut S)
    where
        S: ProcessorSink + ?Sized,
    {
        if let Some(change) = self.tracker.resolve_id(id) {
            sink.emit(change.into());
        }
    }

    fn on_custom<S>(&mut self, name: String, data: serde_json::Value, sink: &mut S)
    where
        S: ProcessorSink + ?Sized,
    {
        match name.as_str() {
            APPROVAL_REQUESTED => match serde_json::from_value::<ApprovalRequest>(data) {
                Ok(request) => {
                    self.resolve_id(&request.tool_call_id, sink);
                    let change = self.tracker.update(&request.tool_call_id, |call| {
                        match call.apply(Trigger::RequestApproval) {
                            Ok(_) => call.approval = Some(request.approval.clone()),
                            Err(err) => tracing::warn!(error = %err, "approval request rejected"),
                        }
                    });
                    if let Some(change) = change {
                        sink.emit(change.into());
                    }
                    sink.emit(ProcessorEvent::ApprovalRequested(request));
                }
                Err(err) => tracing::warn!(error = %err, "malformed approval request"),
            },
            TOOL_INPUT_AVAILABLE => match serde_json::from_value::<ToolInputRequest>(data) {
                Ok(request) => {
                    self.resolve_id(&request.tool_call_id, sink);
                    if let Some(change) = self.tracker.end(&request.tool_call_id) {
                        sink.emit(change.into());
                    }
                    sink.emit(ProcessorEvent::ToolInputAvailable(request));
                }
                Err(err) => tracing::warn!(error = %err, "malformed tool input event"),
            },
            _ => sink.emit(ProcessorEvent::Custom { name, data }),
        }
    }
}

fn emit_changes<S>(changes: Vec<ToolCallChange>, sink: &mut S)
where
    S: ProcessorSink + ?Sized,
{
    for change in changes {
        sink.emit(change.into());
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
