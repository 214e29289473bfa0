//! Agent loop: connect, process, resolve tools, repeat.

pub mod approvals;
pub mod chat;
pub mod strategy;

pub use approvals::{approval_policy, ApprovalDecision, ApprovalHandler};
pub use chat::{ChatClient, CycleOutcome};
pub use strategy::{
    always, combine, max_iterations, until_finish_reason, AgentLoopState, ContinuationStrategy,
};
