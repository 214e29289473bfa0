//! Convenience re-exports for common use.

pub use crate::agent_loop::{
    approval_policy, max_iterations, until_finish_reason, ApprovalDecision, ChatClient,
    CycleOutcome,
};
pub use crate::assembler::{should_auto_send, MessageList};
pub use crate::config::TurnstileConfig;
#[cfg(feature = "http")]
pub use crate::connection::HttpConnection;
pub use crate::connection::{ChannelConnection, Connection};
pub use crate::error::{Result, TurnstileError};
pub use crate::parser::WireFormat;
pub use crate::processor::{ProcessorEvent, StreamProcessor};
pub use crate::strategy::{ChunkStrategy, StrategyConfig};
pub use crate::tools::{ToolDefinition, ToolRegistry};
pub use crate::types::{
    ChunkEvent, FinishReason, Message, MessagePart, Role, ToolCallPhase, ToolCallState, Usage,
};
