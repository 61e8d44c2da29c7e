//! Speech model capability as seen by the synthesis unit.
//!
//! The model itself is opaque: something that turns text plus a speaker embedding
//! into samples. Loading is split out so the unit can run it off its message loop
//! and report progress while it does.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::embeddings::Speaker;
use super::protocol::UnitMessage;

/// Raw model output.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// A loaded speech synthesis model.
pub trait SpeechModel: Send {
    /// Synthesize `text` in the voice described by `speaker`.
    fn synthesize(&mut self, text: &str, speaker: Speaker<'_>) -> Result<Synthesis>;
}

/// Produces a [`SpeechModel`]. Called on a blocking thread; may take a long time.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, progress: &ProgressReporter) -> Result<Box<dyn SpeechModel>>;
}

/// Coarse load status carried by progress reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Initiate,
    Loading,
    Done,
    Ready,
}

impl std::fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStatus::Initiate => write!(f, "initiate"),
            LoadStatus::Loading => write!(f, "loading"),
            LoadStatus::Done => write!(f, "done"),
            LoadStatus::Ready => write!(f, "ready"),
        }
    }
}

/// One model-load progress report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub percent: u8, // 0-100
    pub status: LoadStatus,
}

/// Handle given to a [`ModelLoader`] for sending progress upstream.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<UnitMessage>,
}

impl ProgressReporter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<UnitMessage>) -> Self {
        Self { tx }
    }

    /// Report progress for `file`; `percent` is clamped to 100.
    pub fn report(&self, file: Option<&str>, percent: u8, status: LoadStatus) {
        let progress = LoadProgress { file: file.map(str::to_string), percent: percent.min(100), status };
        // The controller may already be gone; nothing to do then.
        let _ = self.tx.send(UnitMessage::Progress(progress));
    }
}
