//! Server-Sent Events framing.

use futures::{Stream, StreamExt};

use super::{parse_payload, ChunkNormalizer, ChunkStream, LineBuffer};
use crate::error::TurnstileError;
use crate::types::ChunkEvent;

/// Payload marking the end of an SSE chunk stream.
pub const DONE_MARKER: &str = "[DONE]";

/// A dispatched SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
}

/// Line-level SSE decoder. Only `data` fields carry chunks; `event`, `id`,
/// `retry` and comment lines are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line. A blank line dispatches the buffered data lines.
    pub fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field != "data" {
            return None;
        }
        if value == DONE_MARKER && self.data.is_empty() {
            return Some(SseFrame::Done);
        }
        self.data.push(value.to_string());
        None
    }

    /// Dispatch any data left when the body ends without a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame::Data(data))
    }
}

/// Decode an SSE byte stream into chunks, stopping at `data: [DONE]`.
pub fn decode<S, B, E>(source: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<TurnstileError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut lines = LineBuffer::new();
        let mut decoder = SseDecoder::new();
        let mut normalizer = ChunkNormalizer::new();
        let mut source = std::pin::pin!(source);

        while let Some(read) = source.next().await {
            let bytes = match read {
                Ok(bytes) => bytes,
                Err(err) => {
                    yield Err(err.into());
                    return;
                }
            };
            for line in lines.push(bytes.as_ref()) {
                match decoder.feed_line(&line) {
                    Some(SseFrame::Done) => return,
                    Some(SseFrame::Data(data)) => {
                        if let Some(chunk) = parse_payload(&mut normalizer, &data) {
                            yield Ok(chunk);
                        }
                    }
                    None => {}
                }
            }
        }

        if let Some(line) = lines.finish() {
            if let Some(SseFrame::Done) = decoder.feed_line(&line) {
                return;
            }
        }
        if let Some(SseFrame::Data(data)) = decoder.finish() {
            if let Some(chunk) = parse_payload(&mut normalizer, &data) {
                yield Ok(chunk);
            }
        }
    };
    Box::pin(stream)
}

/// Format a chunk as an SSE data frame.
pub fn encode_chunk(chunk: &ChunkEvent) -> Result<String, TurnstileError> {
    Ok(format!("data: {}\n\n", serde_json::to_string(chunk)?))
}

/// The SSE end-of-stream marker frame.
pub fn encode_done() -> String {
    format!("data: {DONE_MARKER}\n\n")
}

/// Format an error as an SSE `error` chunk frame.
pub fn encode_error(error: &TurnstileError) -> Result<String, TurnstileError> {
    let code = match error {
        TurnstileError::Stream { code, .. } => code.clone(),
        other => Some(format!("{:?}", other.category()).to_lowercase()),
    };
    let message = match error {
        TurnstileError::Stream { message, .. } => message.clone(),
        other => other.to_string(),
    };
    encode_chunk(&ChunkEvent::Error { message, code })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed_line("event: message"), None);
        assert_eq!(decoder.feed_line("data: {\"type\":"), None);
        assert_eq!(decoder.feed_line("data: \"done\"}"), None);
        assert_eq!(
            decoder.feed_line(""),
            Some(SseFrame::Data("{\"type\":\n\"done\"}".to_string()))
        );
    }

    #[test]
    fn decoder_ignores_comments_and_recognizes_done() {
        let mut decoder = SseDecoder::new();
        assert_eq!(decoder.feed_line(": keep-alive"), None);
        assert_eq!(decoder.feed_line("data: [DONE]"), Some(SseFrame::Done));
    }

    #[test]
    fn encode_round_trips_through_decoder() {
        let frame = encode_chunk(&ChunkEvent::text("hi")).unwrap();
        assert_eq!(frame, "data: {\"type\":\"text-delta\",\"delta\":\"hi\"}\n\n");
        assert_eq!(encode_done(), "data: [DONE]\n\n");
    }

    #[test]
    fn encode_error_uses_stream_code() {
        let frame =
            encode_error(&TurnstileError::stream("overloaded", Some("529".into()))).unwrap();
        assert!(frame.contains("\"message\":\"overloaded\""));
        assert!(frame.contains("\"code\":\"529\""));
    }
}
