//! Conversions between samples and the S16LE byte stream monitors carry.

/// Converts an f32 sample to i16.
///
/// Input should be in the range [-1.0, 1.0]; values outside it are clamped.
/// Scales by 32767, so -1.0 maps to -32767.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Converts an i16 sample to f32 in the range [-1.0, 1.0].
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Encodes samples as little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decodes little-endian bytes into samples.
///
/// A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Generates `frames` interleaved frames of a sine tone at `frequency` Hz.
///
/// Every channel carries the same sample.
pub fn sine_tone(frequency: f32, rate: u32, channels: u16, frames: usize) -> Vec<i16> {
    let step = std::f32::consts::TAU * frequency / rate as f32;
    (0..frames)
        .flat_map(|frame| {
            let sample = f32_to_i16((step * frame as f32).sin() * 0.25);
            std::iter::repeat(sample).take(usize::from(channels))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_to_i16_range() {
        assert_eq!(f32_to_i16(1.0), 32767);
        assert_eq!(f32_to_i16(-1.0), -32767);
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(2.0), 32767);
        assert_eq!(f32_to_i16(-2.0), -32768);
    }

    #[test]
    fn test_i16_to_f32_range() {
        assert!((i16_to_f32(-32768) + 1.0).abs() < f32::EPSILON);
        assert_eq!(i16_to_f32(0), 0.0);
    }

    #[test]
    fn test_bytes_are_little_endian() {
        assert_eq!(samples_to_bytes(&[0x0102, -1]), vec![0x02, 0x01, 0xff, 0xff]);
        assert_eq!(bytes_to_samples(&[0x02, 0x01, 0xff, 0xff, 0x07]), vec![0x0102, -1]);
    }

    #[test]
    fn test_sine_tone_is_interleaved() {
        let tone = sine_tone(440.0, 48_000, 2, 64);
        assert_eq!(tone.len(), 128);
        assert_eq!(tone[0], 0);
        for frame in tone.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert!(tone.iter().any(|&s| s != 0));
    }
}
