//! Audio utility functions.
//!
//! PCM format description, sample conversion, and WAV artifact
//! encoding/decoding via `hound`.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};

/// Sample rate and channel count of an interleaved f32 PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// Interleaved samples per second.
    pub fn samples_per_sec(&self) -> usize {
        self.sample_rate as usize * self.channels.max(1) as usize
    }

    /// Duration covered by `samples` interleaved samples, in milliseconds.
    pub fn duration_ms(&self, samples: usize) -> f64 {
        let per_sec = self.samples_per_sec();
        if per_sec == 0 {
            return 0.0;
        }
        samples as f64 / per_sec as f64 * 1000.0
    }
}

/// Decoded clip held fully in memory.
#[derive(Debug, Clone)]
pub struct Clip {
    pub samples: Vec<f32>,
    pub format: PcmFormat,
}

/// Convert i16 PCM samples to f32 (range -1.0 .. 1.0).
pub fn pcm_i16_to_f32(input: &[i16]) -> Vec<f32> {
    input.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert f32 PCM samples to i16.
pub fn pcm_f32_to_i16(input: &[f32]) -> Vec<i16> {
    input
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Decode raw little-endian s16 bytes. A trailing odd byte is ignored.
pub fn s16le_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

fn decode_reader<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<Clip> {
    let spec = reader.spec();
    let format = PcmFormat {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    };
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read WAV samples")?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1) as u32)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read WAV samples")?
        }
    };
    Ok(Clip { samples, format })
}

/// Decode an in-memory WAV file.
pub fn decode_wav_bytes(bytes: &[u8]) -> Result<Clip> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).context("failed to parse WAV data")?;
    decode_reader(reader)
}

/// Decode a WAV file from disk.
pub fn read_wav(path: &Path) -> Result<Clip> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open WAV file {}", path.display()))?;
    decode_reader(reader)
}

/// Write interleaved f32 samples as a 16-bit PCM WAV file.
pub fn write_wav(path: &Path, samples: &[f32], format: PcmFormat) -> Result<()> {
    let spec = hound::WavSpec {
        channels: format.channels.max(1),
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create WAV file {}", path.display()))?;
    for s in pcm_f32_to_i16(samples) {
        writer.write_sample(s).context("failed to write WAV sample")?;
    }
    writer.finalize().context("failed to finalize WAV file")?;
    Ok(())
}
