//! Client side of streamed narration: read chunk records as they arrive,
//! decode them, release the first audio early and chain every chunk into
//! one gapless, ordered playback.

pub mod chainer;
pub mod client;
pub mod config;
pub mod consumer;
pub mod decoder;
pub mod error;
pub mod gate;
pub mod session;
pub mod sink;

pub use chainer::{ChainAction, ChainTiming, LinkState, PlaybackChainer, UnitState};
pub use client::NarrationClient;
pub use config::PlaybackConfig;
pub use consumer::{ConsumerEvent, LineBuffer, StreamConsumer};
pub use decoder::{decode_payload, ChunkDecoder, DecodedAudio, PlayableUnit};
pub use error::{DecodeError, MalformedRecordError, NarrationError, PlaybackError, TransportError};
pub use gate::{EarlyRelease, EarlyReleaseGate, PendingRelease};
pub use session::{
    spawn_narration, ChainSummary, NarrationEvent, NarrationHandle, NarrationReport, StreamState,
};
pub use sink::{AudioSink, ClockSink, PlayLog, PlaybackRejected, SinkEvent, SinkEventKind, UnitEvents};
