//! Connections: where a turn's chunk stream comes from.

mod channel;
#[cfg(feature = "http")]
mod http;

pub use channel::{ChannelConnection, ChannelResponder, ConnectRequest};
#[cfg(feature = "http")]
pub use http::HttpConnection;

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::parser::ChunkStream;
use crate::types::Message;

/// Source of chunk streams, one per connect cycle.
///
/// Implementations must stop producing chunks promptly once `cancel` fires.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(
        &self,
        messages: &[Arc<Message>],
        data: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<ChunkStream>;
}

/// End `stream` as soon as `cancel` fires.
pub fn until_cancelled(stream: ChunkStream, cancel: CancellationToken) -> ChunkStream {
    stream
        .take_until(async move { cancel.cancelled().await })
        .boxed()
}
