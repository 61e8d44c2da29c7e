//! Speech synthesis orchestration.
//!
//! A [`Controller`] owns one isolated synthesis unit (see [`ThreadSpawner`]) that
//! lazily loads a [`SpeechModel`] and a speaker [`EmbeddingTable`], and answers each
//! request with a WAV-encoded [`AudioClip`].

mod clip;
mod controller;
mod embeddings;
#[cfg(feature = "sherpa")]
mod kokoro;
mod load;
mod model;
mod protocol;
mod subscribers;
mod unit;
mod wav;

#[cfg(test)]
pub(crate) mod testing;

pub use clip::AudioClip;
pub use controller::Controller;
pub use embeddings::{EMBEDDING_DIM, EmbeddingSource, EmbeddingTable, Speaker, to_le_bytes};
#[cfg(feature = "sherpa")]
pub use kokoro::{KokoroLoader, split_sentences};
pub use model::{LoadProgress, LoadStatus, ModelLoader, ProgressReporter, SpeechModel, Synthesis};
pub use protocol::{UnitMessage, UnitRequest};
pub use subscribers::Subscription;
pub use unit::{ThreadSpawner, UnitHandle, UnitSpawner};
pub use wav::{WAV_HEADER_LEN, encode_wav, to_pcm16};
