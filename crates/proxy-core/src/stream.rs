use std::pin::Pin;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::ByteStream;

/// A single normalized piece of streamed output (spec.md §4.9 `StreamingContent`).
/// Serializable so adapters that consume real upstream SSE can canonicalize it
/// to newline-delimited JSON before handing it back as a `ByteStream`
/// (spec.md §4.7, §4.9 — the adapter translates wire framing, the core only
/// ever sees the canonical shape).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingContent {
    pub content: String,
    pub metadata: Value,
    pub is_done: bool,
    pub is_cancellation: bool,
}

impl StreamingContent {
    pub fn chunk(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Value::Null,
            is_done: false,
            is_cancellation: false,
        }
    }

    pub fn done() -> Self {
        Self {
            content: String::new(),
            metadata: Value::Null,
            is_done: true,
            is_cancellation: false,
        }
    }

    pub fn cancellation() -> Self {
        Self {
            content: String::new(),
            metadata: Value::Null,
            is_done: true,
            is_cancellation: true,
        }
    }
}

pub type NormalizedStream = Pin<Box<dyn Stream<Item = Result<StreamingContent>> + Send>>;

/// Decouples the pipeline from upstream transport framing: byte frames,
/// SSE, or provider-specific chunk shapes all normalize to the same
/// `StreamingContent` sequence (spec.md §4.9 "stream normalizer"). Each
/// yielded item is processed immediately; nothing is buffered in full.
pub trait StreamSource: Send {
    fn into_normalized(self: Box<Self>) -> NormalizedStream;
}

/// Adapts an already-parsed sequence of provider chunks (e.g. OpenAI-style
/// `choices[0].delta.content` fragments extracted upstream) into the
/// normalized stream. Concrete wire decoding (SSE framing, provider JSON
/// shapes) lives in `proxy-providers`; this crate only defines the seam.
pub struct ChunkSource<S> {
    inner: S,
}

impl<S> ChunkSource<S>
where
    S: Stream<Item = Result<StreamingContent>> + Send + 'static,
{
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> StreamSource for ChunkSource<S>
where
    S: Stream<Item = Result<StreamingContent>> + Send + 'static,
{
    fn into_normalized(self: Box<Self>) -> NormalizedStream {
        Box::pin(self.inner)
    }
}

/// Wraps a non-streaming reply as a single-item stream so the middleware
/// chain can treat both paths uniformly (spec.md §4.9 "non-streaming
/// responses are treated as single-item streams internally"). Literally one
/// item: the full content, already marked done.
pub fn single_item_stream(content: String) -> NormalizedStream {
    let mut item = StreamingContent::chunk(content);
    item.is_done = true;
    Box::pin(futures::stream::iter(vec![Ok(item)]))
}

/// Decodes a canonical newline-delimited-JSON `ByteStream` of `StreamingContent`
/// records into a `NormalizedStream`, buffering only the incomplete tail of
/// the current line across reads (spec.md §4.9 "never buffers the whole
/// response; each yielded item is processed immediately"). This is the
/// counterpart adapters in `proxy-providers` target when they parse a
/// provider's real upstream SSE framing into the canonical wire shape.
pub fn decode_canonical_byte_stream(bytes: ByteStream) -> NormalizedStream {
    struct State {
        bytes: ByteStream,
        buffer: Vec<u8>,
        pending: std::collections::VecDeque<Result<StreamingContent>>,
        finished: bool,
    }

    let state = State {
        bytes,
        buffer: Vec::new(),
        pending: std::collections::VecDeque::new(),
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    while let Some(pos) = state.buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                        let line = &line[..line.len() - 1];
                        if line.iter().all(|b| b.is_ascii_whitespace()) {
                            continue;
                        }
                        match serde_json::from_slice::<StreamingContent>(line) {
                            Ok(content) => state.pending.push_back(Ok(content)),
                            Err(e) => state.pending.push_back(Err(e.into())),
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.push_back(Err(e));
                }
                None => {
                    state.finished = true;
                    if !state.buffer.iter().all(|b| b.is_ascii_whitespace()) {
                        if let Ok(content) = serde_json::from_slice::<StreamingContent>(&state.buffer) {
                            state.pending.push_back(Ok(content));
                        }
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_item_stream_yields_one_completed_item() {
        let mut stream = single_item_stream("hello".to_string());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.content, "hello");
        assert!(first.is_done);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn decode_canonical_byte_stream_splits_lines_across_chunks() {
        let a = serde_json::to_vec(&StreamingContent::chunk("hel")).unwrap();
        let b = serde_json::to_vec(&StreamingContent::chunk("lo")).unwrap();
        let mut first_chunk = a;
        first_chunk.push(b'\n');
        // Split the second line's bytes across two raw reads to exercise the
        // partial-line buffer.
        let mid = b.len() / 2;
        let raw: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(bytes::Bytes::from(first_chunk)),
            Ok(bytes::Bytes::from(b[..mid].to_vec())),
            Ok(bytes::Bytes::from({
                let mut rest = b[mid..].to_vec();
                rest.push(b'\n');
                rest
            })),
        ]));
        let mut decoded = decode_canonical_byte_stream(raw);
        let first = decoded.next().await.unwrap().unwrap();
        assert_eq!(first.content, "hel");
        let second = decoded.next().await.unwrap().unwrap();
        assert_eq!(second.content, "lo");
        assert!(decoded.next().await.is_none());
    }
}
