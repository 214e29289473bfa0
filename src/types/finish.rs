//! Finish reasons reported by the `done` chunk.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Why the model stopped producing output for a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    #[serde(other)]
    Other,
}
