//! # Audio Processing
//!
//! Sample-level handling of the inbound stream before it reaches a recognizer.
//!
//! ## Key Components:
//! - **pcm**: Even-length normalization and little-endian sample conversion
//! - **resampler**: Stateless 2× linear-interpolation upsampler (8 kHz → 16 kHz)

pub mod pcm;
pub mod resampler;

pub use resampler::{upsample, INPUT_SAMPLE_RATE, RECOGNIZER_SAMPLE_RATE};
