//! Kokoro speech model backed by sherpa-rs.

use anyhow::Result;
use sherpa_rs::OnnxConfig;
use sherpa_rs::tts::{CommonTtsConfig, KokoroTts, KokoroTtsConfig};
use tracing::{debug, info};

use super::embeddings::Speaker;
use super::model::{LoadStatus, ModelLoader, ProgressReporter, SpeechModel, Synthesis};
use crate::config::AppConfig;

/// Kokoro output rate.
const KOKORO_SAMPLE_RATE: u32 = 24000;

/// Builds [`KokoroModel`]s from the model files named in the configuration.
pub struct KokoroLoader {
    config: AppConfig,
}

impl KokoroLoader {
    pub fn new(config: &AppConfig) -> Self {
        info!("Using Kokoro TTS with {} provider ({} threads)", config.effective_provider(), config.tts_threads);
        Self { config: config.clone() }
    }

    fn tts_config(&self) -> KokoroTtsConfig {
        let config = &self.config;
        KokoroTtsConfig {
            model: config.tts_model_path().to_string_lossy().to_string(),
            voices: config.tts_voices_path().to_string_lossy().to_string(),
            tokens: config.tts_tokens_path().to_string_lossy().to_string(),
            data_dir: config.tts_data_dir().to_string_lossy().to_string(),
            dict_dir: config.tts_dict_dir().to_string_lossy().to_string(),
            lexicon: config.tts_lexicon(),
            lang: config.tts_espeak_language().to_string(),
            length_scale: 1.0 / config.tts_speed, // inverse of speed
            onnx_config: OnnxConfig {
                provider: config.effective_provider().as_sherpa_provider().to_string(),
                num_threads: config.tts_threads.try_into().unwrap_or(2),
                debug: config.verbose,
            },
            common_config: CommonTtsConfig { max_num_sentences: 1, ..Default::default() }, // Kokoro only supports 1
        }
    }
}

impl ModelLoader for KokoroLoader {
    fn load(&self, progress: &ProgressReporter) -> Result<Box<dyn SpeechModel>> {
        let tts_config = self.tts_config();
        let file = tts_config.model.clone();
        progress.report(Some(&file), 0, LoadStatus::Initiate);
        progress.report(Some(&file), 0, LoadStatus::Loading);

        let tts = KokoroTts::new(tts_config);

        progress.report(Some(&file), 100, LoadStatus::Done);
        progress.report(None, 100, LoadStatus::Ready);
        info!("TTS sample rate: {} Hz", KOKORO_SAMPLE_RATE);

        Ok(Box::new(KokoroModel { tts, speed: self.config.tts_speed }))
    }
}

/// Loaded Kokoro engine. Voices are selected by table index.
pub struct KokoroModel {
    tts: KokoroTts,
    speed: f32,
}

impl SpeechModel for KokoroModel {
    fn synthesize(&mut self, text: &str, speaker: Speaker<'_>) -> Result<Synthesis> {
        let sentences = split_sentences(text);
        anyhow::ensure!(!sentences.is_empty(), "nothing to synthesize");

        let sid = voice_id(speaker)?;
        let mut samples = Vec::new();
        for (i, sentence) in sentences.iter().enumerate() {
            debug!("Synthesizing sentence {}/{}: \"{}\"", i + 1, sentences.len(), sentence);
            let audio = self.tts.create(sentence, sid, self.speed).map_err(|e| anyhow::anyhow!("TTS generation failed: {}", e))?;
            samples.extend_from_slice(&audio.samples);
        }

        Ok(Synthesis { samples, sample_rate: KOKORO_SAMPLE_RATE })
    }
}

/// Kokoro voice id for a resolved table row. The table is laid out in Kokoro voice order.
fn voice_id(speaker: Speaker<'_>) -> Result<i32> {
    i32::try_from(speaker.index).map_err(|_| anyhow::anyhow!("speaker index {} exceeds Kokoro's voice id range", speaker.index))
}

/// Split text into sentences on `.`, `!`, `?` and newlines.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);
        if matches!(c, '.' | '!' | '?' | '\n') {
            push_trimmed(&mut sentences, &current);
            current.clear();
        }
    }
    push_trimmed(&mut sentences, &current);

    sentences
}

fn push_trimmed(sentences: &mut Vec<String>, fragment: &str) {
    let trimmed = fragment.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
}
