//! In-memory connection fed through channels.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{until_cancelled, Connection};
use crate::error::{Result, TurnstileError};
use crate::parser::ChunkStream;
use crate::types::{ChunkEvent, Message};

/// What a connect call was asked to send.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub messages: Vec<Message>,
    pub data: Option<Value>,
}

type Response = mpsc::UnboundedReceiver<Result<ChunkEvent>>;

#[derive(Debug, Default)]
struct Inner {
    responses: VecDeque<Response>,
    requests: Vec<ConnectRequest>,
}

/// A connection whose responses are queued ahead of time, one per connect.
///
/// Useful for embedding a local producer and for tests.
#[derive(Debug, Clone, Default)]
pub struct ChannelConnection {
    inner: Arc<Mutex<Inner>>,
}

/// Producer side of one queued response.
#[derive(Debug, Clone)]
pub struct ChannelResponder {
    tx: mpsc::UnboundedSender<Result<ChunkEvent>>,
}

impl ChannelResponder {
    /// Send a chunk. Returns `false` once the consumer is gone.
    pub fn send(&self, chunk: ChunkEvent) -> bool {
        self.tx.send(Ok(chunk)).is_ok()
    }

    /// Fail the stream with a transport-level error.
    pub fn fail(&self, err: TurnstileError) -> bool {
        self.tx.send(Err(err)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ChannelConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next connect and return its producer. The
    /// stream ends when every clone of the responder is dropped.
    pub fn respond(&self) -> ChannelResponder {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().responses.push_back(rx);
        ChannelResponder { tx }
    }

    /// Queue a complete response.
    pub fn respond_with(&self, chunks: impl IntoIterator<Item = ChunkEvent>) {
        let responder = self.respond();
        for chunk in chunks {
            responder.send(chunk);
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn connect(
        &self,
        messages: &[Arc<Message>],
        data: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        let response = {
            let mut inner = self.lock();
            inner.requests.push(ConnectRequest {
                messages: messages.iter().map(|m| Message::clone(m)).collect(),
                data,
            });
            inner.responses.pop_front()
        };
        let rx = response
            .ok_or_else(|| TurnstileError::Transport("no response queued".to_string()))?;
        Ok(until_cancelled(
            UnboundedReceiverStream::new(rx).boxed(),
            cancel,
        ))
    }
}
