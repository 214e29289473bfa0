//! Newline-delimited JSON framing.

use futures::{Stream, StreamExt};

use super::{parse_payload, ChunkNormalizer, ChunkStream, LineBuffer};
use crate::error::TurnstileError;

/// Decode an NDJSON byte stream into chunks. Blank lines are ignored.
pub fn decode<S, B, E>(source: S) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<TurnstileError> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut lines = LineBuffer::new();
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
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(chunk) = parse_payload(&mut normalizer, &line) {
                    yield Ok(chunk);
                }
            }
        }

        if let Some(line) = lines.finish() {
            if !line.trim().is_empty() {
                if let Some(chunk) = parse_payload(&mut normalizer, &line) {
                    yield Ok(chunk);
                }
            }
        }
    };
    Box::pin(stream)
}
