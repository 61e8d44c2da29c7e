//! Messages exchanged between the controller and the synthesis unit.

use serde::{Deserialize, Serialize};

use super::model::LoadProgress;

/// Controller → unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitRequest {
    Speak { request_id: u64, text: String, speaker_index: usize },
}

/// Unit → controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitMessage {
    /// Model load progress.
    Progress(LoadProgress),
    /// Number of voices, sent once after the embedding table first loads.
    EmbeddingsInfo { count: usize },
    /// Encoded WAV container for one request.
    Complete { request_id: u64, buffer: Vec<u8> },
    /// Failure report; `request_id` is set when it belongs to a specific request.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        message: String,
    },
}

impl UnitMessage {
    /// Correlation id of a terminal message, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            UnitMessage::Complete { request_id, .. } => Some(*request_id),
            UnitMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}
