//! Text-to-speech orchestration.
//!
//! Synthesis runs inside an isolated unit on its own thread; callers talk to it
//! through a [`tts::Controller`] that correlates requests, enforces a timeout and
//! fans out progress, voice-count and error notifications.

pub mod config;
pub mod error;
pub mod tts;

pub use error::TtsError;
