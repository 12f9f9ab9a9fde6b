use std::io::Cursor;

use anyhow::Context;
use base64::{engine::general_purpose, Engine as _};

use crate::format::AudioFormat;

/// Size of the canonical RIFF/WAVE header written by [`encode_wav`].
pub const WAV_HEADER_LEN: usize = 44;

/// Largest data chunk the 32-bit RIFF size fields can describe.
pub const MAX_DATA_BYTES: usize = (u32::MAX - 36) as usize;

const WAVE_FORMAT_IEEE_FLOAT: u16 = 3;

/// Encode mono f32 samples as a self-contained IEEE-float WAV file.
///
/// Samples are written verbatim (no clamping or requantization) so a
/// decoded chunk reproduces its input bit for bit.
pub fn encode_wav(samples: &[f32], format: AudioFormat) -> Vec<u8> {
    let num_channels: u16 = 1;
    let bits_per_sample = format.bits_per_sample();
    let block_align: u16 = num_channels * format.bytes_per_sample;
    let data_size = format.samples_to_bytes(samples.len()) as u32;
    let riff_size: u32 = 36 + data_size;

    let mut out = Vec::<u8>::with_capacity(WAV_HEADER_LEN + data_size as usize);

    // RIFF header
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&riff_size.to_le_bytes());
    out.extend_from_slice(b"WAVE");

    // fmt chunk
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&WAVE_FORMAT_IEEE_FLOAT.to_le_bytes());
    out.extend_from_slice(&num_channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&format.byte_rate().to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }

    out
}

/// [`encode_wav`] followed by standard Base64, as carried in a chunk record.
pub fn encode_wav_base64(samples: &[f32], format: AudioFormat) -> String {
    general_purpose::STANDARD.encode(encode_wav(samples, format))
}

/// Read a mono float32 WAV container back into samples.
pub fn decode_wav(bytes: &[u8]) -> anyhow::Result<(AudioFormat, Vec<f32>)> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).context("not a WAV container")?;
    let spec = reader.spec();

    if spec.channels != 1 {
        anyhow::bail!("expected mono audio, found {} channels", spec.channels);
    }
    if spec.sample_format != hound::SampleFormat::Float || spec.bits_per_sample != 32 {
        anyhow::bail!(
            "expected 32-bit float samples, found {}-bit {:?}",
            spec.bits_per_sample,
            spec.sample_format
        );
    }

    let samples = reader
        .into_samples::<f32>()
        .collect::<Result<Vec<f32>, _>>()
        .context("truncated sample data")?;

    Ok((AudioFormat::mono_f32(spec.sample_rate), samples))
}
