//! Error taxonomy for the synthesis pipeline.
//!
//! Every failure the unit or controller can hit maps to one variant here. Unit-side
//! errors travel upstream as their `Display` text inside an `error` message.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while starting the synthesis unit or serving a request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TtsError {
    /// The isolated execution unit could not be constructed.
    #[error("failed to start synthesis unit: {0}")]
    Initialization(String),

    /// The model or the embedding resource failed to load.
    #[error("failed to load {resource}: {reason}")]
    Load { resource: &'static str, reason: String },

    #[error("speaker embeddings file is unexpectedly small ({0} values)")]
    EmbeddingsTooSmall(usize),

    #[error("invalid value detected in speaker embeddings at position {0}")]
    InvalidEmbeddingValue(usize),

    #[error("speaker embedding vector length invalid: expected {expected} got {actual}")]
    EmbeddingLength { expected: usize, actual: usize },

    /// Model inference failed (or panicked) for one request.
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("failed to encode audio: {0}")]
    Encoding(String),

    /// Caller-side only: no reply arrived before the controller's timer fired.
    #[error("TTS request timed out after {}s: the network may be slow", .0.as_secs())]
    Timeout(Duration),

    #[error("synthesis unit is not running")]
    UnitClosed,
}

impl TtsError {
    /// Shorthand for a [`TtsError::Load`] failure.
    pub fn load(resource: &'static str, reason: impl ToString) -> Self {
        TtsError::Load { resource, reason: reason.to_string() }
    }

    /// Whether this failure came from malformed embedding data.
    pub fn is_validation(&self) -> bool {
        matches!(self, TtsError::EmbeddingsTooSmall(_) | TtsError::InvalidEmbeddingValue(_) | TtsError::EmbeddingLength { .. })
    }
}
