use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use tracing::{debug, warn};
use tts_core::{wav, AudioFormat, ChunkRecord};

use crate::error::DecodeError;

/// Audio ready to hand to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub format: AudioFormat,
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.samples.len())
    }

    /// Join consecutive segments into one. The first segment's format wins.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a DecodedAudio>, fallback: AudioFormat) -> Self {
        let mut format = None;
        let mut samples = Vec::new();
        for part in parts {
            format.get_or_insert(part.format);
            samples.extend_from_slice(&part.samples);
        }
        Self {
            format: format.unwrap_or(fallback),
            samples,
        }
    }
}

#[derive(Debug)]
enum Resource {
    Pending,
    Loaded(Arc<DecodedAudio>),
    Failed,
    Released,
}

/// One playable handle per received chunk.
///
/// The unit owns its decoded audio until its playback ends; releasing is
/// idempotent.
#[derive(Debug)]
pub struct PlayableUnit {
    index: usize,
    resource: Resource,
}

impl PlayableUnit {
    pub fn pending(index: usize) -> Self {
        Self {
            index,
            resource: Resource::Pending,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn attach(&mut self, audio: Arc<DecodedAudio>) {
        match self.resource {
            Resource::Pending => self.resource = Resource::Loaded(audio),
            _ => debug!(index = self.index, "ignoring audio for a settled unit"),
        }
    }

    pub fn mark_failed(&mut self) {
        if matches!(self.resource, Resource::Pending) {
            self.resource = Resource::Failed;
        }
    }

    pub fn audio(&self) -> Option<Arc<DecodedAudio>> {
        match &self.resource {
            Resource::Loaded(audio) => Some(Arc::clone(audio)),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.resource, Resource::Loaded(_))
    }

    pub fn is_released(&self) -> bool {
        matches!(self.resource, Resource::Released)
    }

    /// Drop the backing audio. Returns `false` if it was already released.
    pub fn release(&mut self) -> bool {
        if self.is_released() {
            return false;
        }
        self.resource = Resource::Released;
        true
    }
}

/// Decode a chunk payload synchronously.
pub fn decode_payload(record: &ChunkRecord) -> Result<DecodedAudio, DecodeError> {
    let index = record.index;
    let bytes = general_purpose::STANDARD
        .decode(record.data.as_bytes())
        .map_err(|source| DecodeError::Base64 { index, source })?;

    let (format, samples) = wav::decode_wav(&bytes).map_err(|e| DecodeError::Container {
        index,
        reason: format!("{e:#}"),
    })?;

    if samples.is_empty() {
        return Err(DecodeError::Empty { index });
    }
    if samples.len() != record.samples as usize {
        warn!(
            index,
            declared = record.samples,
            actual = samples.len(),
            "chunk sample count differs from its record"
        );
    }
    Ok(DecodedAudio { format, samples })
}

/// Turns chunk records into playable audio off the event loop, bounded by
/// a metadata timeout so one bad payload cannot stall the chain.
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    expected: AudioFormat,
    metadata_timeout: Duration,
}

impl ChunkDecoder {
    pub fn new(expected: AudioFormat, metadata_timeout: Duration) -> Self {
        Self {
            expected,
            metadata_timeout,
        }
    }

    pub async fn decode(&self, record: ChunkRecord) -> Result<DecodedAudio, DecodeError> {
        let index = record.index;
        let work = tokio::task::spawn_blocking(move || decode_payload(&record));

        let audio = match tokio::time::timeout(self.metadata_timeout, work).await {
            Err(_) => {
                return Err(DecodeError::Timeout {
                    index,
                    after: self.metadata_timeout,
                })
            }
            Ok(Err(join_err)) => {
                return Err(DecodeError::Task {
                    index,
                    reason: join_err.to_string(),
                })
            }
            Ok(Ok(result)) => result?,
        };

        if audio.format.sample_rate != self.expected.sample_rate {
            warn!(
                index,
                expected = self.expected.sample_rate,
                actual = audio.format.sample_rate,
                "chunk sample rate differs from the configured rate"
            );
        }
        debug!(index, secs = audio.duration().as_secs_f64(), "chunk decoded");
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u32, samples: &[f32]) -> ChunkRecord {
        ChunkRecord {
            index,
            data: wav::encode_wav_base64(samples, AudioFormat::mono_f32(8_000)),
            samples: samples.len() as u32,
        }
    }

    #[tokio::test]
    async fn test_decode_valid_chunk() {
        let decoder = ChunkDecoder::new(AudioFormat::mono_f32(8_000), Duration::from_secs(5));
        let audio = decoder.decode(record(0, &[0.1; 800])).await.unwrap();
        assert_eq!(audio.samples.len(), 800);
        assert_eq!(audio.duration(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_decode_rejects_bad_base64() {
        let decoder = ChunkDecoder::new(AudioFormat::default(), Duration::from_secs(5));
        let bad = ChunkRecord {
            index: 4,
            data: "***".to_string(),
            samples: 1,
        };
        let err = decoder.decode(bad).await.unwrap_err();
        assert!(matches!(err, DecodeError::Base64 { index: 4, .. }));
    }

    #[tokio::test]
    async fn test_decode_rejects_non_wav() {
        let decoder = ChunkDecoder::new(AudioFormat::default(), Duration::from_secs(5));
        let bad = ChunkRecord {
            index: 2,
            data: general_purpose::STANDARD.encode(b"plain text, not audio"),
            samples: 1,
        };
        let err = decoder.decode(bad).await.unwrap_err();
        assert_eq!(err.index(), 2);
        assert!(matches!(err, DecodeError::Container { .. }));
    }

    #[test]
    fn test_decode_rejects_empty_audio() {
        let err = decode_payload(&record(1, &[])).unwrap_err();
        assert!(matches!(err, DecodeError::Empty { index: 1 }));
    }

    #[test]
    fn test_unit_release_is_idempotent() {
        let mut unit = PlayableUnit::pending(0);
        assert!(!unit.is_ready());
        unit.attach(Arc::new(DecodedAudio {
            format: AudioFormat::default(),
            samples: vec![0.0; 4],
        }));
        assert!(unit.is_ready());
        assert!(unit.audio().is_some());

        assert!(unit.release());
        assert!(!unit.release());
        assert!(unit.audio().is_none());
        assert!(unit.is_released());
    }

    #[test]
    fn test_concat_keeps_order() {
        let format = AudioFormat::mono_f32(1_000);
        let a = DecodedAudio { format, samples: vec![1.0, 2.0] };
        let b = DecodedAudio { format, samples: vec![3.0] };
        let joined = DecodedAudio::concat([&a, &b], AudioFormat::default());
        assert_eq!(joined.samples, vec![1.0, 2.0, 3.0]);
        assert_eq!(joined.format, format);
    }
}
