//! Turnstile: stream reconciliation for AI chat turns.
//!
//! Turns an incremental stream of model output chunks into a consistent,
//! ordered message history. Text is surfaced at a configurable cadence,
//! tool calls move through an explicit state machine, and an agent loop
//! decides when enough client-side results exist to send the next request.
//!
//! # Quick Start
//!
//! ```no_run
//! use turnstile::prelude::*;
//!
//! # async fn example() -> turnstile::error::Result<()> {
//! let config = TurnstileConfig::load()?;
//! let chat = ChatClient::new(HttpConnection::from_config(&config)?)
//!     .with_config(&config)
//!     .on_messages_change(|messages| println!("{} messages", messages.len()));
//! chat.send_message("Hello!").await?;
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod assembler;
pub mod config;
pub mod connection;
pub mod error;
pub mod parser;
pub mod prelude;
pub mod processor;
pub mod strategy;
pub mod tools;
pub mod types;
