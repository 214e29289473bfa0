//! Chat client: drives connect/process cycles over one conversation.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::approvals::ApprovalHandler;
use super::strategy::{max_iterations, AgentLoopState, ContinuationStrategy};
use crate::assembler::{should_auto_send, MessageList};
use crate::config::TurnstileConfig;
use crate::connection::Connection;
use crate::error::{Result, TurnstileError};
use crate::processor::{ProcessorEvent, StreamOutcome, StreamProcessor};
use crate::strategy::{StrategyConfig, StrategyFactory};
use crate::tools::{ToolKind, ToolRegistry};
use crate::types::{ApprovalRequest, FinishReason, Message, ToolInputRequest};

/// Called with the full list after every change.
pub type MessagesListener = Arc<dyn Fn(&MessageList) + Send + Sync>;
pub type LoadingListener = Arc<dyn Fn(bool) + Send + Sync>;
pub type ErrorChangeListener = Arc<dyn Fn(Option<&str>) + Send + Sync>;
/// Called with the assistant message of each completed cycle.
pub type FinishListener = Arc<dyn Fn(&Arc<Message>) + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&TurnstileError) + Send + Sync>;
/// Called with every processor event, before it is applied.
pub type EventListener = Arc<dyn Fn(&ProcessorEvent) + Send + Sync>;

#[derive(Clone, Default)]
struct Callbacks {
    messages: Option<MessagesListener>,
    loading: Option<LoadingListener>,
    error_change: Option<ErrorChangeListener>,
    finish: Option<FinishListener>,
    error: Option<ErrorListener>,
    event: Option<EventListener>,
}

/// How a chat request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing left to do: no tool calls are pending, or the continuation
    /// strategy ended the loop.
    Finished {
        iterations: usize,
        finish_reason: Option<FinishReason>,
    },
    /// The latest assistant message has tool calls still waiting on a
    /// result or an approval decision.
    AwaitingTools {
        iterations: usize,
        pending: Vec<String>,
    },
    /// [`ChatClient::stop`] was called. Everything applied so far stands.
    Cancelled,
    /// No request was made.
    Skipped,
}

#[derive(Debug, Default)]
struct ChatState {
    messages: MessageList,
    is_loading: bool,
    error: Option<String>,
    /// A result or approval was recorded by the caller since the last cycle
    /// ended.
    recorded: bool,
}

/// Work collected while streaming, resolved once the stream ends.
#[derive(Debug, Default)]
struct PendingWork {
    inputs: Vec<ToolInputRequest>,
    approvals: Vec<ApprovalRequest>,
}

/// Orchestrates one conversation against a [`Connection`].
///
/// One client serves one active stream at a time; starting a request while
/// another is in flight fails with [`TurnstileError::InvalidState`].
pub struct ChatClient {
    connection: Arc<dyn Connection>,
    tools: ToolRegistry,
    strategy: StrategyFactory,
    continuation: ContinuationStrategy,
    approval_handler: Option<ApprovalHandler>,
    idle_timeout: Option<Duration>,
    body: Option<Value>,
    callbacks: Callbacks,
    state: Mutex<ChatState>,
    abort: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("tools", &self.tools.names())
            .field("idle_timeout", &self.idle_timeout)
            .field("state", &self.lock())
            .finish()
    }
}

impl ChatClient {
    pub fn new(connection: impl Connection + 'static) -> Self {
        Self::with_connection(Arc::new(connection))
    }

    pub fn with_connection(connection: Arc<dyn Connection>) -> Self {
        let defaults = TurnstileConfig::default();
        Self {
            connection,
            tools: ToolRegistry::new(),
            strategy: defaults.strategy_factory(),
            continuation: max_iterations(defaults.max_iterations),
            approval_handler: None,
            idle_timeout: defaults.idle_timeout(),
            body: None,
            callbacks: Callbacks::default(),
            state: Mutex::new(ChatState::default()),
            abort: Mutex::new(None),
        }
    }

    /// Apply strategy, iteration bound and idle timeout from `config`.
    pub fn with_config(mut self, config: &TurnstileConfig) -> Self {
        self.strategy = config.strategy_factory();
        self.continuation = max_iterations(config.max_iterations);
        self.idle_timeout = config.idle_timeout();
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_strategy(mut self, factory: StrategyFactory) -> Self {
        self.strategy = factory;
        self
    }

    pub fn with_chunk_strategy(self, config: &StrategyConfig) -> Self {
        self.with_strategy(config.factory())
    }

    pub fn with_continuation(mut self, continuation: ContinuationStrategy) -> Self {
        self.continuation = continuation;
        self
    }

    pub fn with_approval_handler(mut self, handler: ApprovalHandler) -> Self {
        self.approval_handler = Some(handler);
        self
    }

    /// `None` disables the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Extra data sent with every connect.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_messages(self, messages: Vec<Message>) -> Self {
        self.lock().messages = messages.into_iter().collect();
        self
    }

    pub fn on_messages_change(mut self, f: impl Fn(&MessageList) + Send + Sync + 'static) -> Self {
        self.callbacks.messages = Some(Arc::new(f));
        self
    }

    pub fn on_loading_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.callbacks.loading = Some(Arc::new(f));
        self
    }

    pub fn on_error_change(mut self, f: impl Fn(Option<&str>) + Send + Sync + 'static) -> Self {
        self.callbacks.error_change = Some(Arc::new(f));
        self
    }

    pub fn on_finish(mut self, f: impl Fn(&Arc<Message>) + Send + Sync + 'static) -> Self {
        self.callbacks.finish = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&TurnstileError) + Send + Sync + 'static) -> Self {
        self.callbacks.error = Some(Arc::new(f));
        self
    }

    pub fn on_event(mut self, f: impl Fn(&ProcessorEvent) + Send + Sync + 'static) -> Self {
        self.callbacks.event = Some(Arc::new(f));
        self
    }

    pub fn messages(&self) -> MessageList {
        self.lock().messages.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().is_loading
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// Send a user message and run the agent loop.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<CycleOutcome> {
        self.append(Message::user(text)).await
    }

    /// Append any message and run the agent loop.
    pub async fn append(&self, message: Message) -> Result<CycleOutcome> {
        let cancel = self.start(|messages| messages.push(message))?;
        self.run(cancel).await
    }

    /// Drop the trailing assistant reply and request a new one.
    pub async fn reload(&self) -> Result<CycleOutcome> {
        if self
            .messages()
            .without_trailing_assistant()
            .is_empty()
        {
            return Ok(CycleOutcome::Skipped);
        }
        let cancel = self.start(MessageList::without_trailing_assistant)?;
        self.run(cancel).await
    }

    /// Cancel the in-flight request. Returns `false` if there was none.
    pub fn stop(&self) -> bool {
        let token = self.abort_lock().take();
        match token {
            Some(token) => {
                tracing::debug!("stopping in-flight request");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Record the output of a client-side tool, then resume if every tool
    /// call of the latest assistant message is now terminal.
    pub async fn add_tool_result(
        &self,
        tool_call_id: &str,
        output: Value,
        error: Option<String>,
    ) -> Result<CycleOutcome> {
        self.record(|m| m.update_tool_call_with_output(tool_call_id, output, error))?;
        self.continue_if_ready().await
    }

    /// Record a human approval decision, then resume if every tool call of
    /// the latest assistant message is now terminal.
    pub async fn add_tool_approval_response(
        &self,
        approval_id: &str,
        approved: bool,
    ) -> Result<CycleOutcome> {
        self.record(|m| m.update_tool_call_approval_response(approval_id, approved))?;
        self.continue_if_ready().await
    }

    /// Cancel any request and forget the conversation.
    pub fn clear(&self) {
        self.stop();
        self.update_messages(MessageList::clear);
        self.set_error(None);
    }

    pub fn set_messages(&self, messages: Vec<Message>) {
        self.update_messages(|_| messages.into_iter().collect());
    }

    async fn continue_if_ready(&self) -> Result<CycleOutcome> {
        if self.is_loading() || !should_auto_send(&self.messages()) {
            return Ok(CycleOutcome::Skipped);
        }
        let cancel = self.start(MessageList::clone)?;
        self.run(cancel).await
    }

    /// Atomically check for an in-flight request, update the messages and
    /// mark the client loading.
    fn start<F>(&self, prepare: F) -> Result<CancellationToken>
    where
        F: FnOnce(&MessageList) -> MessageList,
    {
        let messages = {
            let mut state = self.lock();
            if state.is_loading {
                return Err(TurnstileError::InvalidState(
                    "a request is already in flight".to_string(),
                ));
            }
            state.is_loading = true;
            state.recorded = false;
            state.messages = prepare(&state.messages);
            state.messages.clone()
        };
        let cancel = CancellationToken::new();
        *self.abort_lock() = Some(cancel.clone());

        self.notify_messages(&messages);
        if let Some(listener) = &self.callbacks.loading {
            listener(true);
        }
        self.set_error(None);
        Ok(cancel)
    }

    async fn run(&self, cancel: CancellationToken) -> Result<CycleOutcome> {
        let result = self.run_loop(&cancel).await;

        self.abort_lock().take();
        self.lock().is_loading = false;
        if let Some(listener) = &self.callbacks.loading {
            listener(false);
        }

        match result {
            Ok(outcome) => {
                tracing::debug!(?outcome, "chat request finished");
                Ok(outcome)
            }
            Err(err) => {
                tracing::warn!(error = %err, category = ?err.category(), "chat request failed");
                self.set_error(Some(err.to_string()));
                if let Some(listener) = &self.callbacks.error {
                    listener(&err);
                }
                Err(err)
            }
        }
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let mut iterations = 0usize;

        loop {
            let (outcome, work) = self.cycle(cancel).await?;
            let summary = match outcome {
                StreamOutcome::Completed(summary) => summary,
                StreamOutcome::Cancelled => return Ok(CycleOutcome::Cancelled),
            };
            iterations += 1;

            let resolved = self.resolve_client_side(work, cancel).await;
            let recorded = std::mem::take(&mut self.lock().recorded) || resolved;
            if cancel.is_cancelled() {
                return Ok(CycleOutcome::Cancelled);
            }

            let messages = self.messages();
            if !should_auto_send(&messages) {
                let pending = pending_tool_calls(&messages);
                if pending.is_empty() {
                    return Ok(CycleOutcome::Finished {
                        iterations,
                        finish_reason: summary.finish_reason,
                    });
                }
                return Ok(CycleOutcome::AwaitingTools {
                    iterations,
                    pending,
                });
            }

            let state = AgentLoopState {
                iteration_count: iterations,
                messages: &messages,
                finish_reason: summary.finish_reason,
            };
            if !recorded || !(self.continuation)(&state) {
                tracing::debug!(iterations, recorded, "agent loop stopped");
                return Ok(CycleOutcome::Finished {
                    iterations,
                    finish_reason: summary.finish_reason,
                });
            }
        }
    }

    /// One connect/process cycle into a fresh assistant message.
    async fn cycle(&self, cancel: &CancellationToken) -> Result<(StreamOutcome, PendingWork)> {
        let messages = self.messages();
        tracing::debug!(messages = messages.len(), "starting cycle");
        let stream = self
            .connection
            .connect(messages.as_slice(), self.body.clone(), cancel.clone())
            .await?;
        if cancel.is_cancelled() {
            return Ok((StreamOutcome::Cancelled, PendingWork::default()));
        }

        let message = Message::assistant();
        let message_id = message.id.clone();
        self.update_messages(|m| m.push(message));

        let mut processor = StreamProcessor::new((self.strategy)());
        if let Some(timeout) = self.idle_timeout {
            processor = processor.with_idle_timeout(timeout);
        }

        let mut work = PendingWork::default();
        let mut sink = |event: ProcessorEvent| {
            if let Some(listener) = &self.callbacks.event {
                listener(&event);
            }
            match &event {
                ProcessorEvent::ToolInputAvailable(request) => work.inputs.push(request.clone()),
                ProcessorEvent::ApprovalRequested(request) => work.approvals.push(request.clone()),
                _ => {}
            }
            if changes_messages(&event) {
                self.update_messages(|m| m.apply(&message_id, &event));
            }
        };
        let outcome = processor.run(stream, &mut sink, cancel).await?;

        if matches!(outcome, StreamOutcome::Completed(_)) {
            let finished = self.messages().get(&message_id).cloned();
            if let (Some(listener), Some(message)) = (&self.callbacks.finish, finished) {
                listener(&message);
            }
        }
        Ok((outcome, work))
    }

    /// Run registered client tools and the approval handler. Returns whether
    /// anything was recorded.
    async fn resolve_client_side(&self, work: PendingWork, cancel: &CancellationToken) -> bool {
        let mut recorded = false;

        for request in work.inputs {
            let Some(tool) = self.tools.get(&request.tool_name) else {
                continue;
            };
            let ToolKind::Client { client_execute } = &tool.kind else {
                continue;
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return recorded,
                result = client_execute(request.input.clone()) => result,
            };
            let (output, error) = match result {
                Ok(output) => (output, None),
                Err(err) => {
                    tracing::warn!(tool = %request.tool_name, error = %err, "client tool failed");
                    (json!({ "error": err.to_string() }), Some(err.to_string()))
                }
            };
            recorded |= self
                .try_update_messages(|m| {
                    m.update_tool_call_with_output(&request.tool_call_id, output, error)
                })
                .is_ok();
        }

        let Some(handler) = &self.approval_handler else {
            return recorded;
        };
        for request in work.approvals {
            let approval_id = request.approval.id.clone();
            let decision = tokio::select! {
                _ = cancel.cancelled() => return recorded,
                decision = handler(request) => decision,
            };
            if let Some(approved) = decision.approved() {
                recorded |= self
                    .try_update_messages(|m| {
                        m.update_tool_call_approval_response(&approval_id, approved)
                    })
                    .is_ok();
            }
        }
        recorded
    }

    fn update_messages<F>(&self, f: F) -> MessageList
    where
        F: FnOnce(&MessageList) -> MessageList,
    {
        let messages = {
            let mut state = self.lock();
            state.messages = f(&state.messages);
            state.messages.clone()
        };
        self.notify_messages(&messages);
        messages
    }

    fn try_update_messages<F>(&self, f: F) -> Result<MessageList>
    where
        F: FnOnce(&MessageList) -> Result<MessageList>,
    {
        let messages = {
            let mut state = self.lock();
            state.messages = f(&state.messages)?;
            state.messages.clone()
        };
        self.notify_messages(&messages);
        Ok(messages)
    }

    /// Apply a caller-supplied result or decision. One recorded while a
    /// stream is in flight lets that request continue once the stream ends.
    fn record<F>(&self, f: F) -> Result<MessageList>
    where
        F: FnOnce(&MessageList) -> Result<MessageList>,
    {
        let messages = {
            let mut state = self.lock();
            state.messages = f(&state.messages)?;
            state.recorded = true;
            state.messages.clone()
        };
        self.notify_messages(&messages);
        Ok(messages)
    }

    fn notify_messages(&self, messages: &MessageList) {
        if let Some(listener) = &self.callbacks.messages {
            listener(messages);
        }
    }

    fn set_error(&self, error: Option<String>) {
        let changed = {
            let mut state = self.lock();
            let changed = state.error != error;
            state.error = error.clone();
            changed
        };
        if let (true, Some(listener)) = (changed, &self.callbacks.error_change) {
            listener(error.as_deref());
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_lock(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.abort.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn changes_messages(event: &ProcessorEvent) -> bool {
    matches!(
        event,
        ProcessorEvent::TextUpdate { .. }
            | ProcessorEvent::ToolCallStateChange { .. }
            | ProcessorEvent::ToolResultStateChange { .. }
            | ProcessorEvent::ApprovalRequested(_)
    )
}

/// Ids of the latest assistant message's tool calls that are not terminal.
fn pending_tool_calls(messages: &MessageList) -> Vec<String> {
    messages
        .last_assistant()
        .map(|message| {
            message
                .tool_calls()
                .filter(|call| !call.is_terminal())
                .map(|call| call.id.clone())
                .collect()
        })
        .unwrap_or_default()
}
