//! NDJSON wire records.
//!
//! A narration stream is a sequence of newline-terminated JSON objects:
//!
//! ```text
//! {"index":0,"data":"<base64 WAV>","samples":120000}
//! {"index":1,"data":"<base64 WAV>","samples":55200}
//! {"index":-1,"end":true}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Index carried by the end marker.
pub const END_MARKER_INDEX: i64 = -1;

/// One self-contained encoded audio segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub index: u32,
    /// Base64 of a complete WAV file.
    pub data: String,
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
struct EndMarker {
    index: i64,
    end: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    Chunk(ChunkRecord),
    End,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected record shape: {0}")]
    Shape(String),
}

// Every field optional so shape errors can be reported precisely.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRecord {
    index: i64,
    data: Option<String>,
    samples: Option<i64>,
    end: Option<bool>,
}

impl StreamRecord {
    /// Serialize as a single JSON object followed by `\n`.
    pub fn to_line(&self) -> String {
        let mut line = match self {
            StreamRecord::Chunk(chunk) => serde_json::to_string(chunk),
            StreamRecord::End => serde_json::to_string(&EndMarker {
                index: END_MARKER_INDEX,
                end: true,
            }),
        }
        // Neither shape contains a map with non-string keys.
        .unwrap_or_default();
        line.push('\n');
        line
    }

    /// Parse one line (without its terminator) into a record.
    pub fn parse_line(line: &str) -> Result<StreamRecord, RecordError> {
        let raw: RawRecord = serde_json::from_str(line.trim())?;

        match raw {
            RawRecord {
                index: END_MARKER_INDEX,
                data: None,
                samples: None,
                end: Some(true),
            } => Ok(StreamRecord::End),
            RawRecord {
                index,
                data: Some(data),
                samples: Some(samples),
                end: None,
            } => {
                let index = u32::try_from(index)
                    .map_err(|_| RecordError::Shape(format!("chunk index {index} out of range")))?;
                if samples <= 0 {
                    return Err(RecordError::Shape(format!(
                        "chunk {index} declares {samples} samples"
                    )));
                }
                let samples = u32::try_from(samples)
                    .map_err(|_| RecordError::Shape(format!("chunk {index} sample count too large")))?;
                Ok(StreamRecord::Chunk(ChunkRecord {
                    index,
                    data,
                    samples,
                }))
            }
            RawRecord { index, .. } => Err(RecordError::Shape(format!(
                "record with index {index} is neither a chunk nor an end marker"
            ))),
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, StreamRecord::End)
    }
}
