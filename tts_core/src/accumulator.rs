use tracing::warn;

use crate::format::AudioFormat;

/// What to do with the 1-3 bytes left over when an engine buffer does not
/// end on a sample boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TailPolicy {
    /// Drop the partial sample (historical behavior). Dropped bytes are
    /// counted in [`SampleAccumulator::dropped_tail_bytes`].
    #[default]
    Truncate,
    /// Keep the partial sample and complete it with the next buffer.
    Carry,
}

/// Append-only buffer of float32 samples parsed from raw engine bytes.
#[derive(Debug)]
pub struct SampleAccumulator {
    format: AudioFormat,
    policy: TailPolicy,
    buffer: Vec<f32>,
    tail: Vec<u8>,
    total_samples: usize,
    dropped_tail_bytes: usize,
}

impl SampleAccumulator {
    pub fn new(format: AudioFormat, policy: TailPolicy) -> Self {
        Self {
            format,
            policy,
            buffer: Vec::new(),
            tail: Vec::new(),
            total_samples: 0,
            dropped_tail_bytes: 0,
        }
    }

    /// Parse every complete little-endian sample in `bytes` and append it.
    /// Returns the number of samples appended.
    pub fn accept(&mut self, bytes: &[u8]) -> usize {
        let width = std::mem::size_of::<f32>();

        let joined;
        let input: &[u8] = if self.tail.is_empty() {
            bytes
        } else {
            let mut carried = std::mem::take(&mut self.tail);
            carried.extend_from_slice(bytes);
            joined = carried;
            &joined
        };

        let chunks = input.chunks_exact(width);
        let remainder = chunks.remainder();
        let before = self.buffer.len();
        self.buffer.extend(
            chunks.map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        );

        if !remainder.is_empty() {
            match self.policy {
                TailPolicy::Truncate => {
                    self.dropped_tail_bytes += remainder.len();
                    warn!(
                        bytes = remainder.len(),
                        "dropping partial sample at end of engine buffer"
                    );
                }
                TailPolicy::Carry => self.tail.extend_from_slice(remainder),
            }
        }

        let appended = self.buffer.len() - before;
        self.total_samples += appended;
        appended
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffered_secs(&self) -> f64 {
        self.format.samples_to_secs(self.buffer.len())
    }

    /// Samples ever accepted, including those already taken.
    pub fn total_samples(&self) -> usize {
        self.total_samples
    }

    pub fn dropped_tail_bytes(&self) -> usize {
        self.dropped_tail_bytes
    }

    /// Bytes of an incomplete sample still waiting for the next buffer.
    pub fn pending_tail_bytes(&self) -> usize {
        self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Remove and return the oldest `count` samples (or fewer if not buffered).
    pub fn take(&mut self, count: usize) -> Vec<f32> {
        let count = count.min(self.buffer.len());
        let rest = self.buffer.split_off(count);
        std::mem::replace(&mut self.buffer, rest)
    }

    pub fn take_all(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.buffer)
    }
}
