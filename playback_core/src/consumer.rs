//! Incremental NDJSON reader for the narration response body.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::{Stream, StreamExt};
use tracing::{debug, warn};
use tts_core::{ChunkRecord, StreamRecord};

use crate::error::{MalformedRecordError, TransportError};

/// Splits an arbitrary byte stream into complete lines, keeping the
/// trailing partial line until its terminator arrives.
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
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(Self::to_text(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Bytes of the incomplete trailing line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Take whatever unterminated text is left once the body has closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            self.pending.clear();
            return None;
        }
        let line = Self::to_text(&self.pending);
        self.pending.clear();
        Some(line)
    }

    // Decoding whole lines keeps multi-byte characters split across reads intact.
    fn to_text(raw: &[u8]) -> String {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        String::from_utf8_lossy(raw).into_owned()
    }
}

#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Chunk(ChunkRecord),
    Malformed(MalformedRecordError),
}

/// Pulls chunk records out of a streaming response body.
///
/// Completion is either the explicit end marker or the body closing,
/// whichever comes first; a close without the marker is not an error.
pub struct StreamConsumer<S> {
    body: S,
    lines: LineBuffer,
    ready: VecDeque<String>,
    line_number: usize,
    chunks: usize,
    malformed: usize,
    saw_end_marker: bool,
    done: bool,
}

impl<S, B, E> StreamConsumer<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    pub fn new(body: S) -> Self {
        Self {
            body,
            lines: LineBuffer::new(),
            ready: VecDeque::new(),
            line_number: 0,
            chunks: 0,
            malformed: 0,
            saw_end_marker: false,
            done: false,
        }
    }

    /// Next chunk or malformed-line report; `Ok(None)` once the stream is complete.
    ///
    /// Cancel safe: dropping the future between reads loses no data.
    pub async fn next_event(&mut self) -> Result<Option<ConsumerEvent>, TransportError> {
        loop {
            while let Some(line) = self.ready.pop_front() {
                self.line_number += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match StreamRecord::parse_line(&line) {
                    Ok(StreamRecord::Chunk(chunk)) => {
                        self.chunks += 1;
                        return Ok(Some(ConsumerEvent::Chunk(chunk)));
                    }
                    Ok(StreamRecord::End) => {
                        debug!(chunks = self.chunks, "end marker received");
                        self.saw_end_marker = true;
                        self.done = true;
                        self.ready.clear();
                        return Ok(None);
                    }
                    Err(e) => {
                        self.malformed += 1;
                        let error = MalformedRecordError {
                            line: self.line_number,
                            reason: e.to_string(),
                        };
                        warn!(line = error.line, reason = %error.reason, "skipping malformed stream line");
                        return Ok(Some(ConsumerEvent::Malformed(error)));
                    }
                }
            }

            if self.done {
                return Ok(None);
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    let completed = self.lines.push(bytes.as_ref());
                    self.ready.extend(completed);
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Err(TransportError::new(e.to_string()));
                }
                None => {
                    self.done = true;
                    if let Some(tail) = self.lines.finish() {
                        self.ready.push_back(tail);
                    }
                    debug!(
                        chunks = self.chunks,
                        "response closed without end marker, treating as complete"
                    );
                }
            }
        }
    }

    pub fn chunks_received(&self) -> usize {
        self.chunks
    }

    pub fn malformed_lines(&self) -> usize {
        self.malformed
    }

    pub fn saw_end_marker(&self) -> bool {
        self.saw_end_marker
    }

    pub fn is_done(&self) -> bool {
        self.done && self.ready.is_empty()
    }
}
