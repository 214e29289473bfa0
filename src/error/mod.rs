//! Error types for Turnstile.

use thiserror::Error;

use crate::processor::Trigger;
use crate::types::ToolCallPhase;

/// Primary error type for all Turnstile operations.
///
/// Cancellation is deliberately absent: a cancelled cycle is reported as
/// [`crate::agent_loop::CycleOutcome::Cancelled`], never as an error.
#[derive(Error, Debug)]
pub enum TurnstileError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[cfg(feature = "http")]
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream error: {message}")]
    Stream {
        message: String,
        code: Option<String>,
    },

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid transition for tool call {tool_call_id}: {trigger} from {from}")]
    InvalidTransition {
        tool_call_id: String,
        from: ToolCallPhase,
        trigger: Trigger,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

/// Broad error category used to route handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Parse,
    Stream,
    ToolExecution,
    State,
    Configuration,
    Timeout,
}

impl TurnstileError {
    /// Create a tool execution error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Create an error from a server-sent `error` chunk.
    pub fn stream(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Stream {
            message: message.into(),
            code,
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::Api { .. } | Self::Io(_) => ErrorCategory::Transport,
            #[cfg(feature = "http")]
            Self::Network(_) => ErrorCategory::Transport,
            Self::Parse(_) | Self::Serialization(_) => ErrorCategory::Parse,
            Self::Stream { .. } => ErrorCategory::Stream,
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::InvalidTransition { .. } | Self::InvalidState(_) => ErrorCategory::State,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Timeout(_) => ErrorCategory::Timeout,
        }
    }

    /// Whether this error halts the session it occurred in.
    ///
    /// Parse errors are recovered per line and tool failures are recorded
    /// as tool state, so neither is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Stream | ErrorCategory::Timeout
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TurnstileError>;
