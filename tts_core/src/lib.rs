//! Server-side audio core for progressive narration.
//!
//! A speech engine hands us raw little-endian float32 PCM in arbitrarily
//! sized buffers. [`ChunkEncoder`] cuts that into fixed-duration,
//! independently decodable WAV chunks, and [`StreamRecord`] frames each one
//! as a line of NDJSON for the transport.

pub mod accumulator;
pub mod encoder;
pub mod format;
pub mod record;
pub mod stream;
pub mod wav;

pub use accumulator::{SampleAccumulator, TailPolicy};
pub use encoder::{ChunkEncoder, EncoderConfig, DEFAULT_FLUSH_AFTER};
pub use format::{AudioFormat, DEFAULT_SAMPLE_RATE};
pub use record::{ChunkRecord, RecordError, StreamRecord, END_MARKER_INDEX};
pub use stream::encode_stream;
