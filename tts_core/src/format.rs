//! Sample-format conversion helpers.
//!
//! Every threshold in the pipeline (flush duration, early release) is
//! expressed in seconds but enforced in samples or bytes. Keeping the
//! conversions here, parameterized by rate and sample width, means no
//! module hardcodes `24000` or `4`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reference engine sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;
/// Width of one little-endian float32 sample.
pub const F32_SAMPLE_BYTES: u16 = 4;

/// Mono PCM layout shared by the engine, the encoder and the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bytes_per_sample: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::mono_f32(DEFAULT_SAMPLE_RATE)
    }
}

impl AudioFormat {
    /// Mono IEEE float32 at the given rate.
    pub const fn mono_f32(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bytes_per_sample: F32_SAMPLE_BYTES,
        }
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bytes_per_sample * 8
    }

    /// Bytes of audio per second of playback.
    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.bytes_per_sample as u32
    }

    pub fn samples_to_secs(&self, samples: usize) -> f64 {
        samples as f64 / self.sample_rate as f64
    }

    /// Rounds to the nearest whole sample.
    pub fn secs_to_samples(&self, secs: f64) -> usize {
        if secs <= 0.0 {
            return 0;
        }
        (secs * self.sample_rate as f64).round() as usize
    }

    /// Whole samples contained in `bytes`; a partial trailing sample is not counted.
    pub fn bytes_to_samples(&self, bytes: usize) -> usize {
        bytes / self.bytes_per_sample as usize
    }

    pub fn samples_to_bytes(&self, samples: usize) -> usize {
        samples * self.bytes_per_sample as usize
    }

    pub fn bytes_to_secs(&self, bytes: usize) -> f64 {
        self.samples_to_secs(self.bytes_to_samples(bytes))
    }

    /// Exact to the nanosecond; zero for a zero rate.
    pub fn duration_of(&self, samples: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = samples as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    pub fn samples_in(&self, duration: Duration) -> usize {
        self.secs_to_samples(duration.as_secs_f64())
    }
}
