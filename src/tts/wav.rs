//! Mono 16-bit PCM WAV encoding.

use crate::error::TtsError;

/// Size of the canonical RIFF/WAVE header in bytes.
pub const WAV_HEADER_LEN: usize = 44;

const NUM_CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const BLOCK_ALIGN: u16 = NUM_CHANNELS * (BITS_PER_SAMPLE / 8);

/// Encode normalized f32 samples as a single-channel 16-bit PCM WAV container.
///
/// # Arguments
/// * `samples` - Audio samples, nominally in [-1.0, 1.0] (values outside are clamped)
/// * `sample_rate` - Sample rate in Hz, must be positive
///
/// # Returns
/// The complete WAV file: a 44-byte header followed by little-endian PCM data.
///
/// # Errors
/// Returns [`TtsError::Encoding`] for a zero sample rate or when the data does not
/// fit the 32-bit RIFF size fields.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, TtsError> {
    if sample_rate == 0 {
        return Err(TtsError::Encoding("sample rate must be positive".to_string()));
    }

    let byte_rate = sample_rate
        .checked_mul(u32::from(BLOCK_ALIGN))
        .ok_or_else(|| TtsError::Encoding(format!("sample rate {} Hz is out of range", sample_rate)))?;

    let data_size = u32::try_from(samples.len() * usize::from(BLOCK_ALIGN))
        .ok()
        .filter(|size| *size <= u32::MAX - 36)
        .ok_or_else(|| TtsError::Encoding(format!("{} samples exceed the WAV size limit", samples.len())))?;

    let mut out = Vec::with_capacity(WAV_HEADER_LEN + data_size as usize);

    // RIFF header
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_size).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    // fmt chunk
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&NUM_CHANNELS.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&BLOCK_ALIGN.to_le_bytes());
    out.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    // data chunk
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_size.to_le_bytes());

    for &sample in samples {
        out.extend_from_slice(&to_pcm16(sample).to_le_bytes());
    }

    Ok(out)
}

/// Convert one normalized sample to signed 16-bit PCM.
///
/// Negative values scale by 32768 and non-negative ones by 32767, so both ends of
/// the i16 range are reachable. NaN maps to 0.
pub fn to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 { (s * 32768.0) as i16 } else { (s * 32767.0) as i16 }
}
