//! # 8 kHz → 16 kHz Upsampling
//!
//! Doubles the sample rate of a 16-bit PCM chunk by linear interpolation.
//!
//! ## Chunk independence:
//! Every call works on its own chunk only. The last sample of one chunk is
//! never interpolated against the first sample of the next one; the final odd
//! output slot duplicates the last input sample instead. This produces a small
//! discontinuity at each chunk seam.

use crate::audio::pcm::{even_prefix, sample_at, sample_count, write_sample_at, BYTES_PER_SAMPLE};

/// Sample rate of the audio clients send.
pub const INPUT_SAMPLE_RATE: u32 = 8_000;

/// Sample rate the recognizers are created with.
pub const RECOGNIZER_SAMPLE_RATE: u32 = 16_000;

/// Ratio between the two rates.
pub const UPSAMPLE_FACTOR: usize = (RECOGNIZER_SAMPLE_RATE / INPUT_SAMPLE_RATE) as usize;

/// Upsample one 8 kHz PCM chunk to 16 kHz.
///
/// ## Output layout:
/// For `n` input samples the output has `2n` samples:
/// - even index `i`: input sample `i / 2`, copied verbatim
/// - odd index `i`: mean of input samples `i / 2` and `i / 2 + 1`, rounded half up
/// - last odd index: the last input sample, repeated
///
/// An odd-length input is truncated to even length first. Empty input gives an
/// empty output. The input is never modified.
pub fn upsample(input: &[u8]) -> Vec<u8> {
    let input = even_prefix(input);
    let input_samples = sample_count(input);
    if input_samples == 0 {
        return Vec::new();
    }

    let output_samples = input_samples * UPSAMPLE_FACTOR;
    let mut output = vec![0u8; output_samples * BYTES_PER_SAMPLE];

    for i in 0..output_samples {
        if i % 2 == 0 {
            write_sample_at(&mut output, i, sample_at(input, i / 2));
            continue;
        }

        let prev = i / 2;
        let next = (i + 1) / 2;
        if next < input_samples {
            let sample = round_half_up_mean(sample_at(input, prev), sample_at(input, next));
            write_sample_at(&mut output, i, sample);
        } else if prev < input_samples {
            write_sample_at(&mut output, i, sample_at(input, prev));
        }
        // Neither neighbour in range: the slot stays 0.
    }

    output
}

/// Arithmetic mean of two samples, ties rounded toward positive infinity.
///
/// The mean of two `i16` values always fits in `i16`, so no clamping happens.
#[inline]
fn round_half_up_mean(a: i16, b: i16) -> i16 {
    let sum = a as i32 + b as i32;
    (sum + 1).div_euclid(2) as i16
}
