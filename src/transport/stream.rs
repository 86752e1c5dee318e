//! SSE byte stream → uniform chunk stream.
//!
//! Response bodies arrive as arbitrary byte chunks; lines are reassembled
//! here, `data:` payloads fed to the provider's incremental decoder, and any
//! trailing decoder state flushed at end-of-stream so a response that ends
//! without its terminal event still yields what it carried.

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::Result;
use crate::provider::http::parse_sse_data;
use crate::provider::EventDecoder;
use crate::types::StreamChunk;

use super::ByteStream;

/// Decode a streaming response body into uniform chunks.
pub fn chunk_stream(
    bytes: ByteStream,
    mut decoder: Box<dyn EventDecoder>,
) -> BoxStream<'static, Result<StreamChunk>> {
    stream! {
        let mut bytes = bytes;
        let mut buffer = String::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim_end_matches('\r').to_string();
                buffer.drain(..=line_end);

                if let Some(data) = parse_sse_data(&line) {
                    for chunk in decoder.decode_event(data) {
                        yield Ok(chunk);
                    }
                }
            }
        }

        // An unterminated final line still counts.
        let line = buffer.trim_end_matches('\r');
        if let Some(data) = parse_sse_data(line) {
            for chunk in decoder.decode_event(data) {
                yield Ok(chunk);
            }
        }

        for chunk in decoder.finish() {
            yield Ok(chunk);
        }
    }
    .boxed()
}
