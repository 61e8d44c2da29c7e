//! Playable audio handle returned by the controller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TtsError;

/// An encoded WAV clip, cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    data: Arc<[u8]>,
}

impl AudioClip {
    pub const MIME_TYPE: &'static str = "audio/wav";

    /// Take ownership of an encoded WAV buffer.
    ///
    /// # Errors
    /// Returns [`TtsError::Encoding`] if the buffer is empty.
    pub fn from_wav(buffer: Vec<u8>) -> Result<Self, TtsError> {
        if buffer.is_empty() {
            return Err(TtsError::Encoding("empty audio buffer".to_string()));
        }
        Ok(Self { data: buffer.into() })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn mime_type(&self) -> &'static str {
        Self::MIME_TYPE
    }

    /// Sample rate from the WAV header, if the buffer carries one.
    pub fn sample_rate(&self) -> Option<u32> {
        self.header_u32(24).filter(|_| self.has_wav_header())
    }

    /// Playback length computed from the header's data size and block align.
    pub fn duration(&self) -> Option<Duration> {
        let rate = self.sample_rate().filter(|r| *r > 0)?;
        let block_align = self.data.get(32..34).map(|b| u16::from_le_bytes([b[0], b[1]])).filter(|b| *b > 0)?;
        let frames = self.header_u32(40)? / u32::from(block_align);
        Some(Duration::from_secs_f64(f64::from(frames) / f64::from(rate)))
    }

    /// Write the clip to `path`.
    pub async fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        tokio::fs::write(path, self.as_bytes()).await
    }

    fn has_wav_header(&self) -> bool {
        self.data.len() >= 44 && &self.data[0..4] == b"RIFF" && &self.data[8..12] == b"WAVE"
    }

    fn header_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
