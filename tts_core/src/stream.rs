//! Streaming encoder.
//!
//! Wraps a live stream of raw engine buffers and yields wire records as
//! soon as each chunk is complete, so neither side holds the whole
//! narration in memory. Records come out strictly in encode order.

use std::fmt::Display;

use async_stream::stream;
use futures_core::Stream;
use futures_util::StreamExt;
use tracing::warn;

use crate::encoder::{ChunkEncoder, EncoderConfig};
use crate::record::StreamRecord;

/// Encode engine PCM into chunk records followed by the end marker.
///
/// An engine error ends the input early: whatever audio arrived is still
/// flushed and the stream is terminated normally.
pub fn encode_stream<S, B, E>(input: S, config: EncoderConfig) -> impl Stream<Item = StreamRecord>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    stream! {
        let mut encoder = ChunkEncoder::new(config);
        futures_util::pin_mut!(input);

        while let Some(next) = input.next().await {
            match next {
                Ok(bytes) => {
                    encoder.accept(bytes.as_ref());
                    for chunk in encoder.drain_ready() {
                        yield StreamRecord::Chunk(chunk);
                    }
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        chunks = encoder.chunks_emitted(),
                        "speech engine failed mid-stream, finalizing with received audio"
                    );
                    break;
                }
            }
        }

        for record in encoder.finalize() {
            yield record;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;

    use super::*;
    use crate::accumulator::TailPolicy;
    use crate::format::AudioFormat;

    fn config() -> EncoderConfig {
        EncoderConfig {
            format: AudioFormat::mono_f32(1_000),
            flush_after: Duration::from_millis(100),
            tail_policy: TailPolicy::Truncate,
        }
    }

    fn bytes_of(count: usize) -> Vec<u8> {
        (0..count).flat_map(|i| (i as f32 * 0.001).to_le_bytes()).collect()
    }

    #[tokio::test]
    async fn test_stream_yields_chunks_then_end() {
        let input = stream::iter(vec![
            Ok::<_, String>(bytes_of(60)),
            Ok(bytes_of(60)),
            Ok(bytes_of(130)),
        ]);
        let records: Vec<StreamRecord> = encode_stream(input, config()).collect().await;

        let indices: Vec<u32> = records
            .iter()
            .filter_map(|r| match r {
                StreamRecord::Chunk(c) => Some(c.index),
                StreamRecord::End => None,
            })
            .collect();
        // 250 samples at 100 per chunk
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(records.last().unwrap().is_end());
    }

    #[tokio::test]
    async fn test_engine_error_still_terminates_stream() {
        let input = stream::iter(vec![
            Ok(bytes_of(150)),
            Err("engine connection reset".to_string()),
            Ok(bytes_of(500)),
        ]);
        let records: Vec<StreamRecord> = encode_stream(input, config()).collect().await;

        assert_eq!(records.len(), 3);
        match &records[1] {
            StreamRecord::Chunk(c) => assert_eq!(c.samples, 50),
            StreamRecord::End => panic!("expected remainder chunk"),
        }
        assert!(records[2].is_end());
    }

    #[tokio::test]
    async fn test_empty_engine_output() {
        let input = stream::iter(Vec::<Result<Vec<u8>, String>>::new());
        let records: Vec<StreamRecord> = encode_stream(input, config()).collect().await;
        assert_eq!(records, vec![StreamRecord::End]);
    }
}
