use std::time::Duration;

use tracing::{debug, info, warn};

use crate::accumulator::{SampleAccumulator, TailPolicy};
use crate::format::AudioFormat;
use crate::record::{ChunkRecord, StreamRecord};
use crate::wav;

/// Reference flush threshold.
pub const DEFAULT_FLUSH_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderConfig {
    pub format: AudioFormat,
    /// Buffered duration that triggers a chunk.
    pub flush_after: Duration,
    pub tail_policy: TailPolicy,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            flush_after: DEFAULT_FLUSH_AFTER,
            tail_policy: TailPolicy::default(),
        }
    }
}

/// Turns accumulated samples into fixed-duration, self-contained chunks.
///
/// Every non-final chunk holds exactly `flush_after` worth of samples; the
/// excess stays buffered for the next chunk. `finalize` emits the remainder
/// and then exactly one end marker.
#[derive(Debug)]
pub struct ChunkEncoder {
    config: EncoderConfig,
    accumulator: SampleAccumulator,
    flush_samples: usize,
    next_index: u32,
    finished: bool,
}

impl ChunkEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        let requested = config.format.samples_in(config.flush_after);
        let flush_samples = requested.clamp(1, max_chunk_samples(config.format));
        if flush_samples < requested {
            warn!(requested, flush_samples, "flush threshold exceeds the largest WAV chunk, clamping");
        }
        Self {
            accumulator: SampleAccumulator::new(config.format, config.tail_policy),
            config,
            flush_samples,
            next_index: 0,
            finished: false,
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Samples per non-final chunk.
    pub fn flush_samples(&self) -> usize {
        self.flush_samples
    }

    pub fn accept(&mut self, bytes: &[u8]) -> usize {
        if self.finished {
            debug!(bytes = bytes.len(), "ignoring engine bytes after finalize");
            return 0;
        }
        self.accumulator.accept(bytes)
    }

    /// Emit one chunk if the buffered duration reached the threshold.
    pub fn maybe_flush(&mut self) -> Option<ChunkRecord> {
        if self.finished || self.accumulator.buffered_samples() < self.flush_samples {
            return None;
        }
        let samples = self.accumulator.take(self.flush_samples);
        Some(self.build_chunk(&samples))
    }

    /// Every chunk that is ready right now, in index order.
    pub fn drain_ready(&mut self) -> Vec<ChunkRecord> {
        std::iter::from_fn(|| self.maybe_flush()).collect()
    }

    /// Flush the remainder (if any) and terminate with the end marker.
    /// Calling it again yields nothing.
    pub fn finalize(&mut self) -> Vec<StreamRecord> {
        if self.finished {
            return Vec::new();
        }

        let mut records: Vec<StreamRecord> = self
            .drain_ready()
            .into_iter()
            .map(StreamRecord::Chunk)
            .collect();

        if !self.accumulator.is_empty() {
            let remainder = self.accumulator.take_all();
            records.push(StreamRecord::Chunk(self.build_chunk(&remainder)));
        }
        self.finished = true;
        records.push(StreamRecord::End);

        if self.next_index == 0 {
            info!("engine produced no audio, emitting end marker only");
        } else {
            info!(
                chunks = self.next_index,
                samples = self.accumulator.total_samples(),
                dropped_tail_bytes = self.accumulator.dropped_tail_bytes(),
                "narration stream finalized"
            );
        }
        records
    }

    pub fn chunks_emitted(&self) -> u32 {
        self.next_index
    }

    /// Whether any audio at all was accumulated.
    pub fn produced_audio(&self) -> bool {
        self.accumulator.total_samples() > 0
    }

    pub fn accumulator(&self) -> &SampleAccumulator {
        &self.accumulator
    }

    fn build_chunk(&mut self, samples: &[f32]) -> ChunkRecord {
        let index = self.next_index;
        self.next_index += 1;
        debug!(
            index,
            samples = samples.len(),
            secs = self.config.format.samples_to_secs(samples.len()),
            "chunk encoded"
        );
        ChunkRecord {
            index,
            data: wav::encode_wav_base64(samples, self.config.format),
            samples: u32::try_from(samples.len()).unwrap_or(u32::MAX),
        }
    }
}

/// Samples that fit in one chunk: bounded by the WAV data size and by the
/// record's `u32` sample count.
fn max_chunk_samples(format: AudioFormat) -> usize {
    format
        .bytes_to_samples(wav::MAX_DATA_BYTES)
        .min(u32::MAX as usize)
        .max(1)
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose, Engine as _};

    use super::*;

    fn config(rate: u32, flush_ms: u64) -> EncoderConfig {
        EncoderConfig {
            format: AudioFormat::mono_f32(rate),
            flush_after: Duration::from_millis(flush_ms),
            tail_policy: TailPolicy::Truncate,
        }
    }

    fn le_bytes(samples: &[f32]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i % 1000) as f32 / 1000.0 - 0.5).collect()
    }

    fn decode(chunk: &ChunkRecord) -> Vec<f32> {
        let bytes = general_purpose::STANDARD.decode(&chunk.data).unwrap();
        wav::decode_wav(&bytes).unwrap().1
    }

    fn encode_all(encoder: &mut ChunkEncoder, input: &[u8], piece: usize) -> Vec<StreamRecord> {
        let mut records = Vec::new();
        for bytes in input.chunks(piece) {
            encoder.accept(bytes);
            records.extend(encoder.drain_ready().into_iter().map(StreamRecord::Chunk));
        }
        records.extend(encoder.finalize());
        records
    }

    #[test]
    fn test_reference_scenario_durations() {
        let cfg = config(24_000, 5_000);
        let mut encoder = ChunkEncoder::new(cfg);
        let total = cfg.format.secs_to_samples(12.3);
        let records = encode_all(&mut encoder, &le_bytes(&ramp(total)), 4096);

        assert_eq!(records.len(), 4);
        assert!(records[3].is_end());

        let chunks: Vec<&ChunkRecord> = records
            .iter()
            .filter_map(|r| match r {
                StreamRecord::Chunk(c) => Some(c),
                StreamRecord::End => None,
            })
            .collect();
        let indices: Vec<u32> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let durations: Vec<f64> = chunks
            .iter()
            .map(|c| cfg.format.samples_to_secs(c.samples as usize))
            .collect();
        assert!((durations[0] - 5.0).abs() < 1e-9);
        assert!((durations[1] - 5.0).abs() < 1e-9);
        assert!((durations[2] - 2.3).abs() < 1e-9);
    }

    #[test]
    fn test_concatenation_reproduces_input() {
        let input = ramp(10_007);
        let bytes = le_bytes(&input);
        for flush_ms in [1, 7, 100, 250, 1_000] {
            for piece in [4, 12, 1_000, 40_000] {
                let mut encoder = ChunkEncoder::new(config(8_000, flush_ms));
                let records = encode_all(&mut encoder, &bytes, piece);

                let mut rebuilt = Vec::new();
                for record in &records {
                    if let StreamRecord::Chunk(chunk) = record {
                        let samples = decode(chunk);
                        assert_eq!(samples.len(), chunk.samples as usize);
                        rebuilt.extend(samples);
                    }
                }
                assert_eq!(rebuilt, input, "flush {flush_ms}ms, piece {piece}");
            }
        }
    }

    #[test]
    fn test_chunk_count_matches_floor_plus_remainder() {
        let format = AudioFormat::mono_f32(1_000);
        for (total, flush_ms) in [(0usize, 100u64), (99, 100), (100, 100), (250, 100), (1_000, 300)] {
            let mut encoder = ChunkEncoder::new(config(1_000, flush_ms));
            let records = encode_all(&mut encoder, &le_bytes(&ramp(total)), 64);

            let flush = format.samples_in(Duration::from_millis(flush_ms));
            let expected_full = total / flush;
            let expected = expected_full + usize::from(total % flush != 0);

            let chunks: Vec<&ChunkRecord> = records
                .iter()
                .filter_map(|r| match r {
                    StreamRecord::Chunk(c) => Some(c),
                    StreamRecord::End => None,
                })
                .collect();
            assert_eq!(chunks.len(), expected, "total {total}, flush {flush_ms}ms");
            assert!(chunks.iter().all(|c| c.samples > 0));
            assert!(chunks
                .iter()
                .take(expected_full)
                .all(|c| c.samples as usize == flush));
            assert_eq!(records.iter().filter(|r| r.is_end()).count(), 1);
            assert!(records.last().unwrap().is_end());
        }
    }

    #[test]
    fn test_no_audio_emits_only_end_marker() {
        let mut encoder = ChunkEncoder::new(EncoderConfig::default());
        // A lone partial sample never becomes audio.
        encoder.accept(&[0x01, 0x02]);
        assert!(encoder.maybe_flush().is_none());

        let records = encoder.finalize();
        assert_eq!(records, vec![StreamRecord::End]);
        assert!(!encoder.produced_audio());
        assert!(encoder.finalize().is_empty());
    }

    #[test]
    fn test_oversized_flush_threshold_is_clamped() {
        let encoder = ChunkEncoder::new(EncoderConfig {
            flush_after: Duration::from_secs(10_000_000),
            ..EncoderConfig::default()
        });
        let limit = max_chunk_samples(AudioFormat::default());
        assert_eq!(encoder.flush_samples(), limit);
        assert!(limit <= u32::MAX as usize);
        assert!(limit * 4 <= wav::MAX_DATA_BYTES);
    }

    #[test]
    fn test_maybe_flush_waits_for_threshold() {
        let mut encoder = ChunkEncoder::new(config(1_000, 100));
        encoder.accept(&le_bytes(&ramp(99)));
        assert!(encoder.maybe_flush().is_none());

        encoder.accept(&le_bytes(&ramp(150)));
        let chunk = encoder.maybe_flush().unwrap();
        assert_eq!(chunk.index, 0);
        assert_eq!(chunk.samples, 100);
        let chunk = encoder.maybe_flush().unwrap();
        assert_eq!(chunk.index, 1);
        assert!(encoder.maybe_flush().is_none());
        assert_eq!(encoder.accumulator().buffered_samples(), 49);
    }
}
