//! Tool system: definitions, registry and server-side execution.

pub mod execute;
pub mod tool;

pub use execute::{
    approval_id, execute_tool_calls, ExecuteToolCallsResult, ToolExecutionResult, DECLINED_MESSAGE,
};
pub use tool::{ToolDefinition, ToolHandler, ToolKind, ToolRegistry};
