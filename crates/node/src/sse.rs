//! Minimal Server-Sent Events decoder for the Gradio queue stream.
//!
//! Only the `data:` field matters to us. Multi-line data is joined with
//! `\n`, comments (`:`) and other fields are skipped, and an event is
//! emitted on each blank line.

use std::collections::VecDeque;

use futures::{Stream, StreamExt};

use crate::client::{EventStream, NodeError};

/// Incremental decoder. Feed it byte chunks, collect complete events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk and return the `data` payload of every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }

    /// Flush at end of stream: whatever the unterminated last line
    /// completes, then a trailing event that was not followed by a blank
    /// line.
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buf.is_empty() {
            let mut tail = std::mem::take(&mut self.buf);
            tail.push(b'\n');
            events = self.push(&tail);
        }
        if !self.data.is_empty() {
            events.push(self.data.join("\n"));
            self.data.clear();
        }
        events
    }
}

struct DecodeState<S> {
    inner: S,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    done: bool,
}

/// Turn a byte stream into a stream of SSE `data` payloads.
///
/// A transport error is yielded once and then the stream ends.
pub fn decode_stream<S, B, E>(inner: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = DecodeState {
        inner,
        decoder: SseDecoder::new(),
        ready: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    state.ready.extend(state.decoder.push(chunk.as_ref()));
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(NodeError::Stream(e.to_string())), state));
                }
                None => {
                    state.done = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
