use crate::error::DecodeError;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree};

// Wire formats expected by the Gemini Live API
pub const INPUT_SAMPLE_RATE: u32 = 16000;
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;
pub const CAPTURE_FRAME_LEN: usize = 4096;
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

const PCM16_SCALE: f32 = 32768.0;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,                     // No cutoff frequency, pass all frequencies
        PolynomialDegree::Cubic, // Cubic interpolation for quality
        chunk_size,
        1, // 1 channel (mono)
    )?;
    Ok(resampler)
}

/// Converts f32 samples in [-1, 1] to PCM16 by scaling by 32768 and truncating.
///
/// Returns the converted samples together with the number of input samples that
/// fell outside [-1, 1] (or were NaN) and had to be clamped.
pub fn encode_f32_to_i16(pcm32: &[f32]) -> (Vec<i16>, usize) {
    let mut clipped = 0;
    let pcm16 = pcm32
        .iter()
        .map(|&sample| {
            if !(-1.0..=1.0).contains(&sample) {
                clipped += 1;
            }
            // `as` saturates and maps NaN to 0
            (sample * PCM16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect();
    (pcm16, clipped)
}

/// Serializes PCM16 samples as little-endian bytes.
pub fn pcm16_to_le_bytes(pcm16: &[i16]) -> Vec<u8> {
    pcm16.iter().flat_map(|&sample| sample.to_le_bytes()).collect()
}

/// Encodes a slice of f32 samples into a base64 string (converting to i16 PCM first).
pub fn encode_f32_to_base64_i16(pcm32: &[f32]) -> String {
    let (pcm16, _) = encode_f32_to_i16(pcm32);
    encode_i16(&pcm16)
}

pub fn encode_i16(pcm16: &[i16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm16_to_le_bytes(pcm16))
}

/// Decodes a base64 PCM16LE payload into raw samples.
pub fn decode_base64_pcm16(base64_fragment: &str) -> Result<Vec<i16>, DecodeError> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(base64_fragment)?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddByteCount(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Splits interleaved PCM16 into one f32 vector per channel, dividing by 32768.
pub fn deinterleave_i16_to_f32(
    pcm16: &[i16],
    channels: usize,
) -> Result<Vec<Vec<f32>>, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::NoChannels);
    }
    if pcm16.len() % channels != 0 {
        return Err(DecodeError::PartialFrame {
            samples: pcm16.len(),
            channels,
        });
    }
    let frame_count = pcm16.len() / channels;
    let mut out = vec![Vec::with_capacity(frame_count); channels];
    for frame in pcm16.chunks_exact(channels) {
        for (channel, &sample) in frame.iter().enumerate() {
            out[channel].push(sample as f32 / PCM16_SCALE);
        }
    }
    Ok(out)
}

/// Reduces interleaved multi-channel input to mono by keeping the first channel.
///
/// Averaging would halve the level of a microphone wired to one channel only.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame[0])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(48000.0, 16000.0, 1024).is_ok());
        assert!(create_resampler(24000.0, 48000.0, 512).is_ok());
        assert!(create_resampler(16000.0, 16000.0, 1024).is_ok());
    }

    #[test]
    fn test_encode_scales_by_32768_and_truncates() {
        let (pcm, clipped) = encode_f32_to_i16(&[0.5, -0.5, 0.0, -1.0, 0.99999]);
        assert_eq!(pcm, vec![16384, -16384, 0, i16::MIN, 32767]);
        assert_eq!(clipped, 0);

        // Truncation toward zero, not rounding
        let (pcm, _) = encode_f32_to_i16(&[0.00005, -0.00005]);
        assert_eq!(pcm, vec![1, -1]);
    }

    #[test]
    fn test_encode_clamps_and_counts_out_of_range() {
        let (pcm, clipped) = encode_f32_to_i16(&[1.0, 2.0, -2.0, f32::NAN, f32::INFINITY]);
        assert_eq!(pcm, vec![i16::MAX, i16::MAX, i16::MIN, 0, i16::MAX]);
        // 1.0 is in range, it only saturates at the top code
        assert_eq!(clipped, 4);
    }

    #[test]
    fn test_le_byte_layout() {
        assert_eq!(pcm16_to_le_bytes(&[16384, -32768]), vec![0x00, 0x40, 0x00, 0x80]);
        let b64 = encode_f32_to_base64_i16(&[0.5]);
        assert_eq!(b64, base64::engine::general_purpose::STANDARD.encode([0x00u8, 0x40]));
    }

    #[test]
    fn test_decode_base64_pcm16() {
        let data = base64::engine::general_purpose::STANDARD.encode([0x00u8, 0x40, 0x00, 0x80]);
        assert_eq!(decode_base64_pcm16(&data).unwrap(), vec![16384, -32768]);

        assert!(matches!(
            decode_base64_pcm16("invalid_base64!"),
            Err(DecodeError::Base64(_))
        ));
        assert!(matches!(decode_base64_pcm16(""), Err(DecodeError::Empty)));

        let odd = base64::engine::general_purpose::STANDARD.encode([0x00u8, 0x40, 0x01]);
        assert!(matches!(
            decode_base64_pcm16(&odd),
            Err(DecodeError::OddByteCount(3))
        ));
    }

    #[test]
    fn test_deinterleave_mono_and_stereo() {
        let mono = deinterleave_i16_to_f32(&[16384, -16384], 1).unwrap();
        assert_eq!(mono.len(), 1);
        assert_abs_diff_eq!(mono[0][0], 0.5);
        assert_abs_diff_eq!(mono[0][1], -0.5);

        let stereo = deinterleave_i16_to_f32(&[100, 200, 300, 400, 500, 600], 2).unwrap();
        assert_eq!(stereo.len(), 2);
        assert_eq!(stereo[0].len(), 3);
        assert_abs_diff_eq!(stereo[0][2], 500.0 / 32768.0);
        assert_abs_diff_eq!(stereo[1][0], 200.0 / 32768.0);
        assert_abs_diff_eq!(stereo[1][2], 600.0 / 32768.0);
    }

    #[test]
    fn test_deinterleave_rejects_bad_layouts() {
        assert!(matches!(
            deinterleave_i16_to_f32(&[1, 2, 3], 2),
            Err(DecodeError::PartialFrame { samples: 3, channels: 2 })
        ));
        assert!(matches!(
            deinterleave_i16_to_f32(&[1, 2], 0),
            Err(DecodeError::NoChannels)
        ));
    }

    #[test]
    fn test_round_trip_within_one_quantization_step() {
        let original: Vec<f32> = (0..2000).map(|i| -1.0 + i as f32 / 1000.0).collect();
        let encoded = encode_f32_to_base64_i16(&original);
        let decoded = decode_base64_pcm16(&encoded).unwrap();
        let decoded = deinterleave_i16_to_f32(&decoded, 1).unwrap().remove(0);

        assert_eq!(decoded.len(), original.len());
        for (original, decoded) in original.iter().zip(decoded.iter()) {
            assert!((original - decoded).abs() <= 1.0 / 32768.0);
        }
    }

    #[test]
    fn test_downmix_keeps_first_channel() {
        assert_eq!(downmix_to_mono(&[0.1, 0.9, 0.2, 0.8], 2), vec![0.1, 0.2]);
        assert_eq!(downmix_to_mono(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn test_wire_constants() {
        assert_eq!(INPUT_SAMPLE_RATE, 16000);
        assert_eq!(OUTPUT_SAMPLE_RATE, 24000);
        assert_eq!(INPUT_MIME_TYPE, "audio/pcm;rate=16000");
    }
}
