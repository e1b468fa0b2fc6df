//! Audio Codec Unit
//!
//! Pure conversions between the telephony wire formats (μ-law or linear16
//! at 8 kHz) and the pipeline format (linear16 at 16 kHz): companding,
//! anti-alias smoothing, linear-interpolation resampling, duration math.
//! Everything here is stateless and operates on plain buffers.

use serde::{Deserialize, Serialize};

/// Sample rate the voice pipeline consumes and produces.
pub const PIPELINE_SAMPLE_RATE: u32 = 16_000;

/// Standard telephony sample rate.
pub const TELEPHONY_SAMPLE_RATE: u32 = 8_000;

/// μ-law code for silence (linear zero).
pub const MULAW_SILENCE: u8 = 0xFF;

/// Payload encoding on the telephony wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM.
    Linear16,
    /// 8-bit μ-law companded PCM.
    Mulaw,
}

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

/// Decode one μ-law byte to a linear sample.
pub fn mulaw_decode(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let exponent = ((b >> 4) & 0x07) as i32;
    let mantissa = (b & 0x0F) as i32;
    let sample = (((mantissa << 3) + MULAW_BIAS) << exponent) - MULAW_BIAS;
    if sign != 0 {
        -sample as i16
    } else {
        sample as i16
    }
}

/// Encode one linear sample as a μ-law byte.
pub fn mulaw_encode(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign: u8 = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    if s > MULAW_CLIP {
        s = MULAW_CLIP;
    }
    s += MULAW_BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (s & mask) == 0 {
        mask >>= 1;
        exponent -= 1;
    }
    let mantissa = ((s >> (exponent + 3)) & 0x0F) as u8;

    !(sign | (exponent << 4) | mantissa)
}

/// Expand a μ-law buffer to linear16 bytes. Output is twice the input length.
pub fn mulaw_to_linear(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.extend_from_slice(&mulaw_decode(b).to_le_bytes());
    }
    out
}

/// Compress a linear16 buffer to μ-law. Output is half the input length;
/// a trailing odd byte is discarded.
pub fn linear_to_mulaw(bytes: &[u8]) -> Vec<u8> {
    bytes
        .chunks_exact(2)
        .map(|c| mulaw_encode(i16::from_le_bytes([c[0], c[1]])))
        .collect()
}

/// Reinterpret little-endian linear16 bytes as samples. A trailing odd
/// byte is discarded.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Pack samples back into little-endian linear16 bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Moving-average smoothing over `window` samples centered on each output
/// sample; the window shrinks at the edges. `window <= 1` is the identity.
/// Applied before downsampling to reduce aliasing.
pub fn low_pass_filter(samples: &[i16], window: usize) -> Vec<i16> {
    if window <= 1 || samples.is_empty() {
        return samples.to_vec();
    }
    let half = window / 2;
    (0..samples.len())
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = (i + (window - half)).min(samples.len());
            let sum: i64 = samples[start..end].iter().map(|&s| s as i64).sum();
            (sum / (end - start) as i64) as i16
        })
        .collect()
}

fn low_pass_window(in_rate: u32, out_rate: u32) -> usize {
    let window = (2 * in_rate).div_ceil(out_rate) as usize;
    window.min(11)
}

/// Resample by linear interpolation. Equal rates return the input
/// unchanged; downsampling is low-pass filtered first. Output length is
/// `floor(len * out_rate / in_rate)`.
pub fn resample(samples: &[i16], in_rate: u32, out_rate: u32) -> Vec<i16> {
    if in_rate == out_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let filtered;
    let src: &[i16] = if out_rate < in_rate {
        filtered = low_pass_filter(samples, low_pass_window(in_rate, out_rate));
        &filtered
    } else {
        samples
    };

    let out_len = (samples.len() as u64 * out_rate as u64 / in_rate as u64) as usize;
    let step = in_rate as f64 / out_rate as f64;
    let last = src.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = (pos as usize).min(last);
        let frac = pos - idx as f64;
        let a = src[idx] as f64;
        let b = src[(idx + 1).min(last)] as f64;
        let v = (a + (b - a) * frac).round();
        out.push(v.clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }
    out
}

/// Convert inbound wire audio to the pipeline format (linear16 @ 16 kHz).
pub fn telephony_to_pipeline(payload: &[u8], encoding: AudioEncoding, in_rate: u32) -> Vec<u8> {
    let samples = match encoding {
        AudioEncoding::Mulaw => payload.iter().map(|&b| mulaw_decode(b)).collect(),
        AudioEncoding::Linear16 => bytes_to_samples(payload),
    };
    samples_to_bytes(&resample(&samples, in_rate, PIPELINE_SAMPLE_RATE))
}

/// Convert pipeline audio (linear16 at `in_rate`) to the telephony wire
/// format: linear16 or μ-law at 8 kHz. μ-law output carries one byte per
/// 8 kHz sample, so its length is `floor(len / 2 * 8000 / in_rate)`.
pub fn pipeline_to_telephony(pcm: &[u8], in_rate: u32, out_encoding: AudioEncoding) -> Vec<u8> {
    let samples = resample(&bytes_to_samples(pcm), in_rate, TELEPHONY_SAMPLE_RATE);
    match out_encoding {
        AudioEncoding::Mulaw => samples.iter().map(|&s| mulaw_encode(s)).collect(),
        AudioEncoding::Linear16 => samples_to_bytes(&samples),
    }
}

/// Playback duration of a buffer in milliseconds.
pub fn duration_ms(bytes: usize, rate: u32, bytes_per_sample: u32) -> f64 {
    bytes as f64 / bytes_per_sample as f64 / rate as f64 * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mulaw_encode_decode_identity() {
        // Every μ-law code survives a decode/encode round trip, except the
        // negative-zero code 0x7F which re-encodes as positive zero 0xFF.
        for byte in 0u8..=255 {
            if byte == 0x7F {
                continue;
            }
            assert_eq!(mulaw_encode(mulaw_decode(byte)), byte, "byte {byte:#04x}");
        }
        assert_eq!(mulaw_decode(0x7F), 0);
        assert_eq!(mulaw_encode(mulaw_decode(0x7F)), MULAW_SILENCE);
    }

    #[test]
    fn test_mulaw_silence() {
        assert_eq!(mulaw_decode(MULAW_SILENCE), 0);
        assert_eq!(mulaw_encode(0), MULAW_SILENCE);
    }

    #[test]
    fn test_mulaw_roundtrip_small_amplitudes() {
        // Quantization steps are at most 16 in the low segments, so the
        // round-trip error is bounded by 8 there.
        for x in -350i16..=350 {
            let y = mulaw_decode(mulaw_encode(x));
            assert!((x as i32 - y as i32).abs() <= 8, "x={x} y={y}");
        }
    }

    #[test]
    fn test_mulaw_roundtrip_relative_error() {
        let mut x = i16::MIN as i32;
        while x <= i16::MAX as i32 {
            let y = mulaw_decode(mulaw_encode(x as i16)) as i32;
            let bound = x.abs() / 16 + 16;
            assert!((x - y).abs() <= bound, "x={x} y={y}");
            x += 37;
        }
    }

    #[test]
    fn test_mulaw_buffer_lengths() {
        let mulaw = vec![MULAW_SILENCE; 160];
        let linear = mulaw_to_linear(&mulaw);
        assert_eq!(linear.len(), 320);
        assert_eq!(linear_to_mulaw(&linear).len(), 160);

        // Trailing odd byte is discarded.
        let odd = mulaw_to_linear(&vec![MULAW_SILENCE; 161]);
        assert_eq!(linear_to_mulaw(&odd[..321]).len(), 160);
        assert!(mulaw_to_linear(&[]).is_empty());
        assert!(linear_to_mulaw(&[]).is_empty());
    }

    #[test]
    fn test_low_pass_identity_window() {
        let samples: Vec<i16> = (0..50).map(|i| (i * 100) as i16).collect();
        assert_eq!(low_pass_filter(&samples, 1), samples);
        assert_eq!(low_pass_filter(&samples, 0), samples);
    }

    #[test]
    fn test_low_pass_averages() {
        let samples = vec![0i16, 300, 0, 300, 0];
        let out = low_pass_filter(&samples, 3);
        // Interior samples average their neighborhood; edges shrink.
        assert_eq!(out[1], 100);
        assert_eq!(out[2], 200);
        assert_eq!(out[0], 150);
        assert_eq!(out.len(), samples.len());
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples: Vec<i16> = (0..317).map(|i| (i as i16).wrapping_mul(113)).collect();
        assert_eq!(resample(&samples, 16_000, 16_000), samples);
    }

    #[test]
    fn test_resample_lengths() {
        let samples = vec![0i16; 441];
        assert_eq!(resample(&samples, 16_000, 8_000).len(), 220);
        assert_eq!(resample(&samples, 8_000, 16_000).len(), 882);
        assert_eq!(resample(&samples, 44_100, 8_000).len(), 80);
        assert_eq!(resample(&samples, 22_050, 16_000).len(), 320);
        assert!(resample(&[], 8_000, 16_000).is_empty());
    }

    #[test]
    fn test_resample_upsampling_interpolates() {
        let out = resample(&[0, 1000], 8_000, 16_000);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 500);
        assert_eq!(out[2], 1000);
        // Past the last source sample the value holds.
        assert_eq!(out[3], 1000);
    }

    #[test]
    fn test_telephony_to_pipeline_lengths() {
        // 160 μ-law bytes @ 8 kHz -> 160 samples -> 320 samples @ 16 kHz.
        let out = telephony_to_pipeline(&vec![MULAW_SILENCE; 160], AudioEncoding::Mulaw, 8_000);
        assert_eq!(out.len(), 640);

        // linear16 @ 16 kHz passes through untouched.
        let pcm = samples_to_bytes(&(0..320).map(|i| i as i16).collect::<Vec<_>>());
        assert_eq!(telephony_to_pipeline(&pcm, AudioEncoding::Linear16, 16_000), pcm);
    }

    #[test]
    fn test_pipeline_to_telephony_mulaw_length() {
        // 400 bytes of linear16 @ 16 kHz are 200 samples; resampling keeps
        // floor(200 * 8000/16000) = 100 samples and μ-law is one byte per
        // sample, so 100 bytes come out.
        let out = pipeline_to_telephony(&vec![0u8; 400], 16_000, AudioEncoding::Mulaw);
        assert_eq!(out.len(), 100);

        // In byte terms: floor(len * 8000 / (rate * 2)) across rates.
        for (len, rate) in [(800usize, 16_000u32), (902, 22_050), (1764, 44_100), (320, 8_000)] {
            let pcm = vec![0u8; len];
            let out = pipeline_to_telephony(&pcm, rate, AudioEncoding::Mulaw);
            let expected = len as u64 * 8_000 / (rate as u64 * 2);
            assert_eq!(out.len(), expected as usize, "len={len} rate={rate}");
        }
        assert!(pipeline_to_telephony(&[], 16_000, AudioEncoding::Mulaw).is_empty());
    }

    #[test]
    fn test_pipeline_to_telephony_silence_is_mulaw_silence() {
        let out = pipeline_to_telephony(&vec![0u8; 640], 16_000, AudioEncoding::Mulaw);
        assert!(out.iter().all(|&b| b == MULAW_SILENCE));
    }

    #[test]
    fn test_duration_ms() {
        assert!((duration_ms(320, 16_000, 2) - 10.0).abs() < f64::EPSILON);
        assert!((duration_ms(160, 8_000, 1) - 20.0).abs() < f64::EPSILON);
        assert_eq!(duration_ms(0, 8_000, 2), 0.0);
    }
}
