//! Server-side resolution of a turn's tool calls.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::tool::{ToolDefinition, ToolKind, ToolRegistry};
use crate::types::{ApprovalRequest, ApprovalState, ToolCallPhase, ToolCallState, ToolInputRequest};

/// Error text recorded when a human declines a gated tool.
pub const DECLINED_MESSAGE: &str = "User declined tool execution";

/// Approval id derived from a tool-call id.
pub fn approval_id(tool_call_id: &str) -> String {
    format!("approval_{tool_call_id}")
}

/// Output of one resolved tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub result: Value,
    /// `output-available` or `output-error`.
    pub state: ToolCallPhase,
}

impl ToolExecutionResult {
    fn ok(call: &ToolCallState, result: Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result,
            state: ToolCallPhase::OutputAvailable,
        }
    }

    fn error(call: &ToolCallState, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            result: json!({ "error": message.into() }),
            state: ToolCallPhase::OutputError,
        }
    }

    pub fn is_error(&self) -> bool {
        self.state == ToolCallPhase::OutputError
    }
}

/// Outcome of [`execute_tool_calls`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteToolCallsResult {
    pub results: Vec<ToolExecutionResult>,
    pub needs_approval: Vec<ApprovalRequest>,
    pub needs_client_execution: Vec<ToolInputRequest>,
}

/// Resolve each tool call against the registry.
///
/// - Client-side tools (client or definition-only) request client execution
///   unless `client_results` already holds their output. When gated, they
///   first need an approval decision.
/// - Gated server tools run once `approvals` holds `approval_<id> = true`.
///   A `false` decision yields a [`DECLINED_MESSAGE`] error result.
/// - Other server tools run immediately.
///
/// Unknown tools, unparsable arguments and handler failures become
/// `output-error` results for that call only.
pub async fn execute_tool_calls(
    calls: &[ToolCallState],
    registry: &ToolRegistry,
    approvals: &HashMap<String, bool>,
    client_results: &HashMap<String, Value>,
) -> ExecuteToolCallsResult {
    let mut outcome = ExecuteToolCallsResult::default();

    for call in calls {
        let Some(tool) = registry.get(&call.name) else {
            outcome.results.push(ToolExecutionResult::error(
                call,
                format!("Unknown tool: {}", call.name),
            ));
            continue;
        };

        let input = match call.parsed_arguments() {
            Ok(input) => input,
            Err(err) => {
                tracing::warn!(tool_call_id = %call.id, error = %err, "unparsable tool arguments");
                outcome
                    .results
                    .push(ToolExecutionResult::error(call, err.to_string()));
                continue;
            }
        };

        let approval = tool
            .needs_approval
            .then(|| approval_id(&call.id))
            .map(|id| (approvals.get(&id).copied(), id));

        match approval {
            Some((None, id)) => {
                outcome.needs_approval.push(ApprovalRequest {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    input,
                    approval: ApprovalState {
                        id,
                        needs_approval: true,
                        approved: None,
                    },
                });
            }
            Some((Some(false), _)) => {
                outcome
                    .results
                    .push(ToolExecutionResult::error(call, DECLINED_MESSAGE));
            }
            Some((Some(true), _)) | None => {
                if let Some(result) = run(tool, call, input, client_results, &mut outcome).await {
                    outcome.results.push(result);
                }
            }
        }
    }

    outcome
}

async fn run(
    tool: &ToolDefinition,
    call: &ToolCallState,
    input: Value,
    client_results: &HashMap<String, Value>,
    outcome: &mut ExecuteToolCallsResult,
) -> Option<ToolExecutionResult> {
    match &tool.kind {
        ToolKind::Server { execute } => Some(match execute(input).await {
            Ok(value) => ToolExecutionResult::ok(call, value),
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "tool execution failed");
                ToolExecutionResult::error(call, err.to_string())
            }
        }),
        ToolKind::Client { .. } | ToolKind::DefinitionOnly => match client_results.get(&call.id) {
            Some(value) => Some(ToolExecutionResult::ok(call, value.clone())),
            None => {
                outcome.needs_client_execution.push(ToolInputRequest {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    input,
                });
                None
            }
        },
    }
}
