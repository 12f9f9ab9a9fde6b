use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tts_core::{AudioFormat, ChunkRecord};

use crate::decoder::{decode_payload, DecodedAudio};

/// Audio released ahead of stream completion.
#[derive(Debug, Clone)]
pub struct EarlyRelease {
    /// Everything received up to the moment the gate fired, concatenated.
    pub audio: Arc<DecodedAudio>,
    /// Cumulative audio declared by the records seen so far.
    pub cumulative: Duration,
    pub chunks: usize,
    /// `true` when the threshold was never reached and the gate fired at
    /// stream completion instead.
    pub at_completion: bool,
}

/// The gate has fired; the buffered chunks still need decoding.
///
/// [`PendingRelease::assemble`] decodes and concatenates synchronously, so
/// callers on an async runtime run it on a blocking thread.
#[derive(Debug)]
pub struct PendingRelease {
    format: AudioFormat,
    records: Vec<ChunkRecord>,
    cumulative: Duration,
    at_completion: bool,
}

impl PendingRelease {
    pub fn chunks(&self) -> usize {
        self.records.len()
    }

    pub fn assemble(self) -> EarlyRelease {
        let decoded: Vec<DecodedAudio> = self
            .records
            .iter()
            .filter_map(|record| match decode_payload(record) {
                Ok(audio) => Some(audio),
                Err(e) => {
                    warn!(error = %e, "leaving undecodable chunk out of early release");
                    None
                }
            })
            .collect();

        EarlyRelease {
            audio: Arc::new(DecodedAudio::concat(&decoded, self.format)),
            cumulative: self.cumulative,
            chunks: self.records.len(),
            at_completion: self.at_completion,
        }
    }
}

/// Fires a single "first audio ready" release once enough audio has arrived,
/// or at completion for narrations shorter than the threshold.
#[derive(Debug)]
pub struct EarlyReleaseGate {
    format: AudioFormat,
    threshold_samples: usize,
    cumulative_samples: usize,
    buffered: Vec<ChunkRecord>,
    fired: bool,
}

impl EarlyReleaseGate {
    pub fn new(format: AudioFormat, threshold: Duration) -> Self {
        Self {
            format,
            threshold_samples: format.samples_in(threshold),
            cumulative_samples: 0,
            buffered: Vec::new(),
            fired: false,
        }
    }

    /// Account for a received chunk; fires when the threshold is crossed.
    pub fn observe(&mut self, record: &ChunkRecord) -> Option<PendingRelease> {
        self.cumulative_samples += record.samples as usize;
        if self.fired {
            return None;
        }
        self.buffered.push(record.clone());

        if self.cumulative_samples >= self.threshold_samples {
            return Some(self.fire(false));
        }
        None
    }

    /// Stream completed. Fires with whatever exists if it never fired before.
    pub fn finalize(&mut self) -> Option<PendingRelease> {
        if self.fired || self.buffered.is_empty() {
            return None;
        }
        Some(self.fire(true))
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn cumulative_audio(&self) -> Duration {
        self.format.duration_of(self.cumulative_samples)
    }

    fn fire(&mut self, at_completion: bool) -> PendingRelease {
        self.fired = true;
        let pending = PendingRelease {
            format: self.format,
            records: std::mem::take(&mut self.buffered),
            cumulative: self.cumulative_audio(),
            at_completion,
        };
        info!(
            secs = pending.cumulative.as_secs_f64(),
            chunks = pending.chunks(),
            at_completion,
            "first audio ready"
        );
        pending
    }
}

#[cfg(test)]
mod tests {
    use tts_core::wav;

    use super::*;

    const RATE: u32 = 1_000;

    fn record(index: u32, samples: usize) -> ChunkRecord {
        let pcm: Vec<f32> = (0..samples).map(|i| (index as f32) + i as f32 * 1e-4).collect();
        ChunkRecord {
            index,
            data: wav::encode_wav_base64(&pcm, AudioFormat::mono_f32(RATE)),
            samples: samples as u32,
        }
    }

    fn gate(threshold_ms: u64) -> EarlyReleaseGate {
        EarlyReleaseGate::new(AudioFormat::mono_f32(RATE), Duration::from_millis(threshold_ms))
    }

    #[test]
    fn test_fires_once_within_one_chunk_of_threshold() {
        let mut gate = gate(3_000);
        assert!(gate.observe(&record(0, 2_000)).is_none());

        let release = gate.observe(&record(1, 2_000)).unwrap().assemble();
        assert!(release.cumulative >= Duration::from_secs(3));
        assert!(release.cumulative < Duration::from_secs(3) + Duration::from_secs(2));
        assert_eq!(release.chunks, 2);
        assert_eq!(release.audio.samples.len(), 4_000);
        assert!(!release.at_completion);

        assert!(gate.observe(&record(2, 2_000)).is_none());
        assert!(gate.finalize().is_none());
        assert_eq!(gate.cumulative_audio(), Duration::from_secs(6));
    }

    #[test]
    fn test_short_narration_fires_at_completion() {
        let mut gate = gate(3_000);
        assert!(gate.observe(&record(0, 500)).is_none());
        assert!(gate.observe(&record(1, 700)).is_none());

        let release = gate.finalize().unwrap().assemble();
        assert!(release.at_completion);
        assert_eq!(release.chunks, 2);
        assert_eq!(release.audio.samples.len(), 1_200);
        assert!(gate.finalize().is_none());
        assert!(gate.has_fired());
    }

    #[test]
    fn test_release_preserves_sample_order() {
        let mut gate = gate(1_000);
        gate.observe(&record(0, 600));
        let release = gate.observe(&record(1, 600)).unwrap().assemble();
        assert_eq!(release.audio.samples[0], 0.0);
        assert_eq!(release.audio.samples[600], 1.0);
    }

    #[test]
    fn test_firing_defers_decoding_to_assembly() {
        let mut gate = gate(1_000);
        gate.observe(&record(0, 600));
        let mut corrupt = record(1, 600);
        corrupt.data = "not base64 audio".to_string();

        let pending = gate.observe(&corrupt).unwrap();
        assert!(gate.has_fired());
        assert_eq!(pending.chunks(), 2);

        let release = pending.assemble();
        assert_eq!(release.chunks, 2);
        assert_eq!(release.audio.samples.len(), 600);
        assert_eq!(release.cumulative, Duration::from_millis(1_200));
    }

    #[test]
    fn test_nothing_received_never_fires() {
        let mut gate = gate(3_000);
        assert!(gate.finalize().is_none());
        assert!(!gate.has_fired());
    }
}
