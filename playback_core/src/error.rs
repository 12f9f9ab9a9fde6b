use std::time::Duration;

use thiserror::Error;

/// The response body failed before the narration finished arriving.
#[derive(Debug, Clone, Error)]
#[error("transport error: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        Self::new(e.to_string())
    }
}

/// A line of the stream that is not a valid record. Skipped, never fatal.
#[derive(Debug, Clone, Error)]
#[error("malformed record on line {line}: {reason}")]
pub struct MalformedRecordError {
    pub line: usize,
    pub reason: String,
}

/// A chunk payload that could not be turned into playable audio.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("chunk {index}: payload is not valid base64: {source}")]
    Base64 {
        index: u32,
        #[source]
        source: base64::DecodeError,
    },

    #[error("chunk {index}: unreadable audio container: {reason}")]
    Container { index: u32, reason: String },

    #[error("chunk {index}: decoded to zero samples")]
    Empty { index: u32 },

    #[error("chunk {index}: metadata not available after {after:?}")]
    Timeout { index: u32, after: Duration },

    #[error("chunk {index}: decode task failed: {reason}")]
    Task { index: u32, reason: String },
}

impl DecodeError {
    pub fn index(&self) -> u32 {
        match self {
            DecodeError::Base64 { index, .. }
            | DecodeError::Container { index, .. }
            | DecodeError::Empty { index }
            | DecodeError::Timeout { index, .. }
            | DecodeError::Task { index, .. } => *index,
        }
    }
}

/// Starting playback of a unit was rejected twice in a row.
#[derive(Debug, Clone, Error)]
#[error("unit {index} failed to play: {reason}")]
pub struct PlaybackError {
    pub index: usize,
    pub reason: String,
}

/// Terminal outcomes of a narration session.
#[derive(Debug, Clone, Error)]
pub enum NarrationError {
    /// The transport failed before a single chunk arrived.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The stream completed without producing any audio.
    #[error("narration produced no audio")]
    EmptyStream,

    #[error("narration aborted")]
    Aborted,
}
