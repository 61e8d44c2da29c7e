//! TTS Orchestrator - synthesize speech to a WAV file through an isolated synthesis unit.
//!
//! The Kokoro model loads lazily on the unit thread on the first request; progress,
//! voice count and errors are reported through the controller's subscriptions.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use tts_orchestrator::config::AppConfig;
use tts_orchestrator::tts::{AudioClip, Controller, KokoroLoader, LoadProgress, LoadStatus, ThreadSpawner};

/// Load the embedding table and print how many voices it holds.
async fn list_voices(config: &AppConfig) -> Result<()> {
    let table = config.embedding_source().load().await.context("Failed to load speaker embeddings")?;
    println!("{} voice(s) available in {}", table.len(), config.embeddings);
    Ok(())
}

/// Run one synthesis, giving up early on Ctrl+C.
async fn synthesize(controller: &Controller, text: &str) -> Option<AudioClip> {
    tokio::select! {
        clip = controller.generate(text, None) => clip,
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_args();

    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env().or_else(|_| if config.verbose { EnvFilter::try_new("debug") } else { EnvFilter::try_new("info") })?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .init();

    info!("🗣️  TTS Orchestrator v{}", env!("CARGO_PKG_VERSION"));

    if config.list_voices {
        return list_voices(&config).await;
    }

    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        std::process::exit(1);
    }
    config.log_config();

    let Some(text) = config.text.as_deref() else {
        anyhow::bail!("no text given");
    };

    let spawner = ThreadSpawner::new(Arc::new(KokoroLoader::new(&config)), config.embedding_source());
    let controller = Controller::with_config(Arc::new(spawner), config.controller_config());

    let _progress = controller.on_progress(|p: &LoadProgress| match p.status {
        LoadStatus::Ready => info!("✅ TTS model ready"),
        status => info!("Loading {}: {}% ({})", p.file.as_deref().unwrap_or("model"), p.percent, status),
    });
    let _errors = controller.on_error(|msg: &str| error!("❌ TTS error: {}", msg));
    let speaker = config.speaker;
    let _voices = controller.on_voice_count(move |count: &usize| {
        info!("{} voice(s) available", count);
        if speaker >= *count {
            warn!("Speaker {} is not in the embedding table, using voice 0", speaker);
        }
    });

    if !controller.init() {
        anyhow::bail!("failed to start the synthesis unit");
    }
    controller.set_speaker_index(config.speaker);

    let result = match synthesize(&controller, text).await {
        Some(clip) => {
            clip.save(&config.output).await.with_context(|| format!("Failed to write {}", config.output.display()))?;
            let seconds = clip.duration().map(|d| d.as_secs_f32()).unwrap_or_default();
            info!("💾 Wrote {} ({} bytes, {:.2}s)", config.output.display(), clip.len(), seconds);
            Ok(())
        }
        None => {
            warn!("No audio produced");
            Err(anyhow::anyhow!("speech synthesis failed"))
        }
    };

    controller.reset();
    info!("✅ TTS orchestrator stopped");
    result
}
