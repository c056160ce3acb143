//! Audio processing utilities.

pub mod resample;

pub use resample::{ResampleError, pcm16_from_le_bytes, pcm16_to_le_bytes, resample_pcm16};
