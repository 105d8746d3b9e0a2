//! # PCM Buffer Helpers
//!
//! Raw request chunks arrive as little-endian 16-bit PCM bytes with no framing.
//! These helpers normalize such buffers and convert them to the sample types
//! the resampler and the recognizers work with.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use tracing::warn;

/// Bytes per 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Return the even-length prefix of a PCM buffer.
///
/// ## Malformed chunks:
/// A buffer with an odd byte count cannot be split into whole samples. The
/// trailing byte is discarded and a warning is logged; this is not an error.
pub fn even_prefix(data: &[u8]) -> &[u8] {
    if data.len() % BYTES_PER_SAMPLE != 0 {
        warn!(
            original_len = data.len(),
            "Audio buffer length is odd, truncating last byte"
        );
        &data[..data.len() - 1]
    } else {
        data
    }
}

/// Number of whole samples contained in `data`.
pub fn sample_count(data: &[u8]) -> usize {
    data.len() / BYTES_PER_SAMPLE
}

/// Read the sample at `index` from an even-length little-endian buffer.
#[inline]
pub fn sample_at(data: &[u8], index: usize) -> i16 {
    let offset = index * BYTES_PER_SAMPLE;
    LittleEndian::read_i16(&data[offset..offset + BYTES_PER_SAMPLE])
}

/// Write `sample` at `index` into a little-endian buffer.
#[inline]
pub fn write_sample_at(data: &mut [u8], index: usize, sample: i16) {
    let offset = index * BYTES_PER_SAMPLE;
    LittleEndian::write_i16(&mut data[offset..offset + BYTES_PER_SAMPLE], sample);
}

/// Decode a PCM byte buffer into samples. A trailing odd byte is ignored.
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(sample_count(data));
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Encode samples as a little-endian PCM byte buffer.
#[cfg(test)]
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Convert 16-bit samples to floats in `[-1.0, 1.0)` for float-based models.
pub fn samples_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Root-mean-square level of float samples, 0.0 for an empty slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum();
    (energy / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_prefix() {
        assert_eq!(even_prefix(&[1, 2, 3]), &[1, 2]);
        assert_eq!(even_prefix(&[1, 2]), &[1, 2]);
        assert!(even_prefix(&[7]).is_empty());
        assert!(even_prefix(&[]).is_empty());
    }

    #[test]
    fn test_sample_access() {
        let mut data = samples_to_bytes(&[0, -1, 32767, -32768]);
        assert_eq!(data, vec![0, 0, 0xff, 0xff, 0xff, 0x7f, 0x00, 0x80]);
        assert_eq!(sample_at(&data, 2), 32767);
        assert_eq!(sample_at(&data, 3), -32768);

        write_sample_at(&mut data, 0, 258);
        assert_eq!(&data[..2], &[2, 1]);
    }

    #[test]
    fn test_bytes_to_samples_ignores_trailing_byte() {
        let samples = bytes_to_samples(&[0x01, 0x00, 0xfe, 0xff, 0x33]);
        assert_eq!(samples, vec![1, -2]);
    }

    #[test]
    fn test_float_conversion_and_rms() {
        let floats = samples_to_f32(&[0, 16384, -32768]);
        assert_eq!(floats, vec![0.0, 0.5, -1.0]);

        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5]) - 0.5).abs() < 1e-6);
    }
}
