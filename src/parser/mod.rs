//! Chunk parser: turns raw byte streams into [`ChunkEvent`]s.
//!
//! Two framings are understood, SSE (`data: <json>` lines terminated by
//! `data: [DONE]`) and newline-delimited JSON. Reads may split a line
//! anywhere, including inside a multi-byte character; [`LineBuffer`]
//! reassembles lines before decoding. A line that fails to decode is logged
//! and skipped, only transport errors end the stream.

pub mod ndjson;
pub mod normalize;
pub mod sse;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::TurnstileError;
use crate::types::ChunkEvent;

pub use normalize::ChunkNormalizer;

/// A stream of normalized chunks.
pub type ChunkStream = BoxStream<'static, Result<ChunkEvent, TurnstileError>>;

/// Framing of a raw response body.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Sse,
    Ndjson,
}

/// Decode a raw byte stream in the given framing.
///
/// Each call returns a fresh, lazily evaluated stream with its own buffers.
pub fn decode<S, B, E>(format: WireFormat, source: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<TurnstileError> + Send + 'static,
{
    match format {
        WireFormat::Sse => sse::decode(source),
        WireFormat::Ndjson => ndjson::decode(source),
    }
}

/// Normalize an already-decoded stream of JSON values.
pub fn from_values<S>(source: S) -> ChunkStream
where
    S: Stream<Item = serde_json::Value> + Send + 'static,
{
    let mut normalizer = ChunkNormalizer::new();
    source
        .filter_map(move |value| futures::future::ready(normalizer.normalize(value).map(Ok)))
        .boxed()
}

/// Reassembles complete lines from arbitrarily split reads.
///
/// Both `\n` and `\r\n` terminate a line; the terminator is not returned.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a read and return every line it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(line) = decode_line(line) {
                lines.push(line);
            }
        }
        lines
    }

    /// Take whatever is left once the source is exhausted.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.pending);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        decode_line(line)
    }
}

fn decode_line(line: Vec<u8>) -> Option<String> {
    match String::from_utf8(line) {
        Ok(line) => Some(line),
        Err(err) => {
            tracing::warn!(error = %err, "skipping line with invalid UTF-8");
            None
        }
    }
}

/// Parse one JSON payload and normalize it, logging and skipping failures.
pub(crate) fn parse_payload(normalizer: &mut ChunkNormalizer, payload: &str) -> Option<ChunkEvent> {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => normalizer.normalize(value),
        Err(err) => {
            tracing::warn!(error = %err, payload, "skipping malformed chunk line");
            None
        }
    }
}
