//! Core types for Turnstile.

pub mod chunk;
pub mod finish;
pub mod message;
pub mod tool_call;
pub mod usage;

pub use chunk::*;
pub use finish::*;
pub use message::*;
pub use tool_call::*;
pub use usage::*;
