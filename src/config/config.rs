//! Application configuration and CLI argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::tts::EmbeddingSource;

/// Default controller-side wait for a synthesis reply.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Hardware acceleration provider for ONNX models.
/// Auto-detected based on platform if not specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// CPU inference (default fallback, always available)
    #[default]
    Cpu,
    /// NVIDIA CUDA acceleration (Linux only, requires CUDA toolkit)
    Cuda,
    /// Apple CoreML acceleration (macOS only, uses Neural Engine)
    #[value(name = "coreml")]
    CoreMl,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sherpa_provider())
    }
}

impl Provider {
    /// Provider string understood by sherpa-onnx.
    pub fn as_sherpa_provider(&self) -> &'static str {
        match self {
            Provider::Cpu => "cpu",
            Provider::Cuda => "cuda",
            Provider::CoreMl => "coreml",
        }
    }
}

/// Library-level controller tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// How long `generate` waits for the unit before giving up.
    pub timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS) }
    }
}

/// Command line configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "tts-orchestrator")]
#[command(author, version, about = "Synthesize speech through an isolated synthesis unit", long_about = None)]
pub struct AppConfig {
    /// Text to synthesize
    #[arg(required_unless_present = "list_voices")]
    pub text: Option<String>,

    /// Print the number of voices in the embedding table and exit
    #[arg(long)]
    pub list_voices: bool,

    /// Directory containing the TTS model files
    #[arg(long, short = 'd', env = "MODEL_DIR", default_value_os_t = default_model_dir())]
    pub model_dir: PathBuf,

    /// Speaker embedding table (file path or http(s) URL), one vector per Kokoro voice
    ///
    /// Kokoro picks its voice by index, so row N of the table must describe Kokoro voice N.
    #[arg(long, env = "TTS_EMBEDDINGS")]
    pub embeddings: String,

    /// Voice index into the embedding table and Kokoro voice id (out-of-range indices use voice 0)
    #[arg(long, short = 's', default_value = "0")]
    pub speaker: usize,

    /// Output WAV file
    #[arg(long, short = 'o', default_value = "speech.wav")]
    pub output: PathBuf,

    /// Milliseconds to wait for a synthesis reply
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Text-to-speech speed multiplier (0.9-0.95 for more natural, expressive speech)
    #[arg(long, default_value = "0.93", value_parser = parse_speed)]
    pub tts_speed: f32,

    /// Pronunciation language: en-us, en-gb and zh use lexicons, anything else goes to espeak-ng
    #[arg(long, default_value = "en-us")]
    pub tts_language: String,

    /// Hardware acceleration provider (auto-detected if not specified)
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    /// TTS threads (0 = auto-detect based on CPU cores)
    #[arg(long, default_value = "0")]
    pub tts_threads: usize,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl AppConfig {
    /// Parse configuration from command line arguments.
    pub fn from_args() -> Self {
        let mut config = Self::parse();
        config.normalize_thread_counts();
        config
    }

    /// Pick a TTS thread count when none was given.
    ///
    /// With CUDA a single thread is used (the GPU handles parallelism); on CPU,
    /// cores/3 leaves headroom for the rest of the process.
    pub fn normalize_thread_counts(&mut self) {
        if self.tts_threads == 0 {
            self.tts_threads = if self.effective_provider() == Provider::Cuda { 1 } else { (num_cpus::get() / 3).max(1) };
        }
    }

    /// Explicit provider, else the detected one.
    pub fn effective_provider(&self) -> Provider {
        self.provider.unwrap_or_else(detect_provider)
    }

    pub fn embedding_source(&self) -> EmbeddingSource {
        EmbeddingSource::parse(&self.embeddings)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig { timeout: Duration::from_millis(self.timeout_ms) }
    }

    fn tts_dir(&self) -> PathBuf {
        self.model_dir.join("tts").join("kokoro-multi-lang-v1_0")
    }

    /// Get the path to the Kokoro TTS model.
    pub fn tts_model_path(&self) -> PathBuf {
        self.tts_dir().join("model.onnx")
    }

    /// Get the path to the Kokoro voices.bin file.
    pub fn tts_voices_path(&self) -> PathBuf {
        self.tts_dir().join("voices.bin")
    }

    pub fn tts_tokens_path(&self) -> PathBuf {
        self.tts_dir().join("tokens.txt")
    }

    /// espeak-ng data directory.
    pub fn tts_data_dir(&self) -> PathBuf {
        self.tts_dir().join("espeak-ng-data")
    }

    /// Dictionary directory (Chinese segmentation).
    pub fn tts_dict_dir(&self) -> PathBuf {
        self.tts_dir().join("dict")
    }

    /// Lexicon file(s) for the configured language; empty when espeak-ng handles it.
    pub fn tts_lexicon(&self) -> String {
        let tts_dir = self.tts_dir();
        match self.tts_language.to_ascii_lowercase().as_str() {
            "en-us" | "en" => tts_dir.join("lexicon-us-en.txt").to_string_lossy().to_string(),
            "en-gb" => tts_dir.join("lexicon-gb-en.txt").to_string_lossy().to_string(),
            // Chinese with English fallback
            "zh" => format!("{},{}", tts_dir.join("lexicon-us-en.txt").to_string_lossy(), tts_dir.join("lexicon-zh.txt").to_string_lossy()),
            _ => String::new(),
        }
    }

    /// espeak-ng language code for languages without a lexicon.
    pub fn tts_espeak_language(&self) -> &str {
        if self.tts_lexicon().is_empty() { self.tts_language.as_str() } else { "" }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.model_dir.exists() {
            anyhow::bail!("Model directory does not exist: {}", self.model_dir.display());
        }

        let required_files = [self.tts_model_path(), self.tts_voices_path(), self.tts_tokens_path()];
        for path in &required_files {
            if !path.exists() {
                anyhow::bail!("Required model file not found: {}", path.display());
            }
        }

        if let EmbeddingSource::File(path) = self.embedding_source()
            && !path.exists()
        {
            anyhow::bail!("Speaker embeddings file not found: {}", path.display());
        }

        if self.timeout_ms == 0 {
            anyhow::bail!("Timeout must be positive");
        }

        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!("Configuration:");
        info!("  Model directory: {}", self.model_dir.display());
        info!("  Speaker embeddings: {}", self.embeddings);
        info!("  Speaker index: {}", self.speaker);
        info!("  Output: {}", self.output.display());
        info!("  Timeout: {}ms", self.timeout_ms);
        info!("  TTS speed: {}", self.tts_speed);
        info!("  TTS language: {}", self.tts_language);
        info!("  TTS provider: {}", self.effective_provider());
        info!("  TTS threads: {}", self.tts_threads);
    }
}

/// Default model directory (~/.tts-orchestrator/models).
fn default_model_dir() -> PathBuf {
    if let Some(home_dir) = dirs::home_dir() {
        home_dir.join(".tts-orchestrator").join("models")
    } else {
        PathBuf::from("models")
    }
}

/// Auto-detect the best hardware acceleration provider.
fn detect_provider() -> Provider {
    #[cfg(target_os = "macos")]
    {
        Provider::CoreMl
    }

    #[cfg(target_os = "linux")]
    {
        if has_nvidia_gpu() { Provider::Cuda } else { Provider::Cpu }
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Provider::Cpu
    }
}

/// Check if an NVIDIA GPU is available (Linux only).
#[cfg(target_os = "linux")]
fn has_nvidia_gpu() -> bool {
    use std::path::Path;

    // Device files, including Jetson's nvhost nodes
    let nvidia_paths = ["/dev/nvidia0", "/dev/nvidiactl", "/dev/nvhost-ctrl", "/dev/nvhost-ctrl-gpu", "/etc/nv_tegra_release"];
    nvidia_paths.iter().any(|path| Path::new(path).exists())
}

/// Parse and validate the speed multiplier (0.25-4.0).
fn parse_speed(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|_| format!("'{}' is not a valid float", s))?;
    if (0.25..=4.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("speed must be between 0.25 and 4.0, got {}", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::try_parse_from(["tts-orchestrator", "--embeddings", "https://example.com/voices.bin", "Hello"]).unwrap();
        assert_eq!(config.text.as_deref(), Some("Hello"));
        assert_eq!(config.speaker, 0);
        assert_eq!(config.controller_config(), ControllerConfig::default());
        assert_eq!(ControllerConfig::default().timeout, Duration::from_secs(60));
        assert_eq!(config.embedding_source(), EmbeddingSource::Url("https://example.com/voices.bin".to_string()));
        assert!(default_model_dir().ends_with(".tts-orchestrator/models") || dirs::home_dir().is_none());
    }

    #[test]
    fn test_embeddings_table_is_required() {
        let err = AppConfig::try_parse_from(["tts-orchestrator", "--speaker", "5", "Hello"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        assert!(AppConfig::try_parse_from(["tts-orchestrator", "--list-voices"]).is_err());
    }

    #[test]
    fn test_text_required_unless_listing() {
        assert!(AppConfig::try_parse_from(["tts-orchestrator", "--embeddings", "voices.bin"]).is_err());
        assert!(AppConfig::try_parse_from(["tts-orchestrator", "--embeddings", "voices.bin", "--list-voices"]).is_ok());
    }

    #[test]
    fn test_speed_range() {
        assert!(parse_speed("1.0").is_ok());
        assert!(parse_speed("0").is_err());
        assert!(parse_speed("fast").is_err());
    }

    #[test]
    fn test_lexicon_selection() {
        let mut config = AppConfig::try_parse_from(["tts-orchestrator", "-d", "/models", "--embeddings", "voices.bin", "Hi"]).unwrap();
        assert!(config.tts_lexicon().ends_with("lexicon-us-en.txt"));
        assert_eq!(config.tts_espeak_language(), "");

        config.tts_language = "es".to_string();
        assert_eq!(config.tts_lexicon(), "");
        assert_eq!(config.tts_espeak_language(), "es");
    }

    #[test]
    fn test_validate_reports_missing_model() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::try_parse_from(["tts-orchestrator", "-d", dir.path().to_str().unwrap(), "--embeddings", "voices.bin", "Hi"]).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("model.onnx"), "{}", err);
    }
}
