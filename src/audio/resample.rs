//! Band-limited PCM resampling.
//!
//! The synthesis fallback produces PCM16 at 16 kHz while the primary model's
//! audio format is PCM16 at 24 kHz, so every synthesized clip passes through
//! here. Resampling uses rubato's chunked FFT resampler, which preserves the
//! time-domain waveform shape; naive sample repetition would audibly distort
//! playback.

use rubato::{FftFixedIn, Resampler};
use thiserror::Error;

/// Input block length fed to the FFT resampler.
const CHUNK: usize = 1024;
/// Sub-chunk count for the FFT resampler.
const SUB_CHUNKS: usize = 2;

/// Errors raised by the resampling pipeline.
#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("resampler construction failed: {0}")]
    Construction(String),

    #[error("resampler processing failed: {0}")]
    Process(String),
}

/// Decode little-endian PCM16 bytes into samples. A trailing odd byte is
/// dropped.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode samples as little-endian PCM16 bytes.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Resample mono PCM16 from `sr_in` to `sr_out`.
///
/// The output length is exactly `round(n * sr_out / sr_in)`: the resampler's
/// filter delay is drained and the tail truncated, so callers can rely on
/// the duration of the clip being preserved.
pub fn resample_pcm16(input: &[i16], sr_in: u32, sr_out: u32) -> Result<Vec<i16>, ResampleError> {
    if sr_in == sr_out || input.is_empty() {
        return Ok(input.to_vec());
    }

    let samples: Vec<f32> = input.iter().map(|&s| f32::from(s) / 32768.0).collect();
    let resampled = resample_mono_f32(&samples, sr_in, sr_out)?;

    Ok(resampled
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect())
}

fn resample_mono_f32(input: &[f32], sr_in: u32, sr_out: u32) -> Result<Vec<f32>, ResampleError> {
    let mut resampler = FftFixedIn::<f32>::new(sr_in as usize, sr_out as usize, CHUNK, SUB_CHUNKS, 1)
        .map_err(|e| ResampleError::Construction(e.to_string()))?;

    let expected = ((input.len() as f64) * f64::from(sr_out) / f64::from(sr_in)).round() as usize;
    let delay = resampler.output_delay();
    let mut out: Vec<f32> = Vec::with_capacity(expected + delay + CHUNK);

    let mut pos = 0;
    while pos < input.len() {
        let end = (pos + CHUNK).min(input.len());
        let mut block = vec![0.0f32; CHUNK];
        block[..end - pos].copy_from_slice(&input[pos..end]);

        let frames = resampler
            .process(&[block], None)
            .map_err(|e| ResampleError::Process(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
        pos = end;
    }

    // Feed silence until the filter delay is fully flushed out of the tail.
    while out.len() < expected + delay {
        let frames = resampler
            .process(&[vec![0.0f32; CHUNK]], None)
            .map_err(|e| ResampleError::Process(e.to_string()))?;
        out.extend_from_slice(&frames[0]);
    }

    Ok(out[delay..delay + expected].to_vec())
}
