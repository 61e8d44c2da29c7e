//! The synthesis unit: an isolated worker owning the model, the embedding table and
//! the encoder, reachable only through channels.
//!
//! Each unit runs on its own OS thread with a single-threaded tokio runtime. Requests
//! are handled one message at a time; they only interleave while waiting on resource
//! loads. Inference runs synchronously on the unit thread, so a long synthesis holds
//! up every message queued behind it.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::embeddings::{EmbeddingSource, EmbeddingTable};
use super::load::LoadCell;
use super::model::{ModelLoader, ProgressReporter, SpeechModel};
use super::protocol::{UnitMessage, UnitRequest};
use super::wav::encode_wav;
use crate::error::TtsError;

type SharedModel = Rc<RefCell<Box<dyn SpeechModel>>>;

/// Controller-side ends of a running unit.
pub struct UnitHandle {
    pub(crate) requests: mpsc::UnboundedSender<UnitRequest>,
    pub(crate) messages: mpsc::UnboundedReceiver<UnitMessage>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) thread: Option<thread::JoinHandle<()>>,
}

impl UnitHandle {
    /// Wrap the channels of a unit. `shutdown` is cancelled when the controller
    /// terminates the unit.
    pub fn new(requests: mpsc::UnboundedSender<UnitRequest>, messages: mpsc::UnboundedReceiver<UnitMessage>, shutdown: CancellationToken) -> Self {
        Self { requests, messages, shutdown, thread: None }
    }
}

/// Constructs synthesis units for a controller.
pub trait UnitSpawner: Send + Sync {
    /// Start a new unit.
    ///
    /// # Errors
    /// Returns [`TtsError::Initialization`] if the execution context cannot be created.
    fn spawn(&self) -> Result<UnitHandle, TtsError>;
}

/// Spawns units on dedicated threads.
pub struct ThreadSpawner {
    loader: Arc<dyn ModelLoader>,
    embeddings: EmbeddingSource,
}

impl ThreadSpawner {
    pub fn new(loader: Arc<dyn ModelLoader>, embeddings: EmbeddingSource) -> Self {
        Self { loader, embeddings }
    }
}

impl UnitSpawner for ThreadSpawner {
    fn spawn(&self) -> Result<UnitHandle, TtsError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("synthesis-unit-blocking")
            .build()
            .map_err(|e| TtsError::Initialization(format!("runtime: {}", e)))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let loader = self.loader.clone();
        let embeddings = self.embeddings.clone();
        let token = shutdown.clone();

        let thread = thread::Builder::new()
            .name("synthesis-unit".to_string())
            .spawn(move || {
                let unit = Rc::new(SynthesisUnit::new(loader, embeddings, message_tx));
                let local = LocalSet::new();
                local.block_on(&runtime, unit.run(request_rx, token));
                drop(local);
                // Don't wait for a model load still running on the blocking pool.
                runtime.shutdown_background();
                debug!("Synthesis unit thread exiting");
            })
            .map_err(|e| TtsError::Initialization(format!("thread: {}", e)))?;

        let mut handle = UnitHandle::new(request_tx, message_rx, shutdown);
        handle.thread = Some(thread);
        Ok(handle)
    }
}

/// State living on the unit thread.
struct SynthesisUnit {
    loader: Arc<dyn ModelLoader>,
    embedding_source: EmbeddingSource,
    outbound: mpsc::UnboundedSender<UnitMessage>,
    model: LoadCell<SharedModel>,
    embeddings: LoadCell<Rc<EmbeddingTable>>,
}

impl SynthesisUnit {
    fn new(loader: Arc<dyn ModelLoader>, embedding_source: EmbeddingSource, outbound: mpsc::UnboundedSender<UnitMessage>) -> Self {
        Self { loader, embedding_source, outbound, model: LoadCell::new(), embeddings: LoadCell::new() }
    }

    /// Message loop. Returns when the controller cancels or drops its sender.
    async fn run(self: Rc<Self>, mut requests: mpsc::UnboundedReceiver<UnitRequest>, shutdown: CancellationToken) {
        info!("🧵 Synthesis unit started");

        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Synthesis unit cancelled");
                    break;
                }
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => {
                        debug!("Request channel closed");
                        break;
                    }
                },
            };

            match request {
                UnitRequest::Speak { request_id, text, speaker_index } => {
                    let unit = self.clone();
                    tokio::task::spawn_local(async move { unit.handle_speak(request_id, text, speaker_index).await });
                }
            }
        }

        info!("Synthesis unit stopped");
    }

    async fn handle_speak(&self, request_id: u64, text: String, speaker_index: usize) {
        debug!("Request {}: speaker {}, {} chars", request_id, speaker_index, text.len());

        let reply = match self.speak(&text, speaker_index).await {
            Ok(buffer) => UnitMessage::Complete { request_id, buffer },
            Err(e) => {
                error!("❌ Request {} failed: {}", request_id, e);
                UnitMessage::Error { request_id: Some(request_id), message: e.to_string() }
            }
        };

        if self.outbound.send(reply).is_err() {
            debug!("Controller gone, dropping reply for request {}", request_id);
        }
    }

    async fn speak(&self, text: &str, speaker_index: usize) -> Result<Vec<u8>, TtsError> {
        let model = self.model().await?;
        let table = self.embeddings().await?;
        let speaker = table.speaker(speaker_index)?;

        let started = Instant::now();
        let output = {
            let mut model = model.borrow_mut();
            panic::catch_unwind(AssertUnwindSafe(|| model.synthesize(text, speaker)))
                .map_err(|payload| TtsError::Synthesis(panic_message(payload)))?
                .map_err(|e| TtsError::Synthesis(format!("{:#}", e)))?
        };

        info!("🎵 Generated speech ({} samples at {} Hz) in {:.2?}", output.samples.len(), output.sample_rate, started.elapsed());
        encode_wav(&output.samples, output.sample_rate)
    }

    async fn model(&self) -> Result<SharedModel, TtsError> {
        if self.model.is_loading() {
            debug!("Waiting for in-flight model load");
        }

        let loader = self.loader.clone();
        let reporter = ProgressReporter::new(self.outbound.clone());
        self.model
            .get_or_load(move || async move {
                info!("Loading speech model...");
                let started = Instant::now();
                let model = tokio::task::spawn_blocking(move || loader.load(&reporter))
                    .await
                    .map_err(|e| TtsError::load("speech model", format!("loader aborted: {}", e)))?
                    .map_err(|e| {
                        warn!("Speech model load failed, will retry on next request");
                        TtsError::load("speech model", format!("{:#}", e))
                    })?;
                info!("✅ Speech model loaded in {:.2?}", started.elapsed());
                Ok(Rc::new(RefCell::new(model)))
            })
            .await
    }

    async fn embeddings(&self) -> Result<Rc<EmbeddingTable>, TtsError> {
        let source = self.embedding_source.clone();
        let outbound = self.outbound.clone();
        self.embeddings
            .get_or_load(move || async move {
                let table = source.load().await?;
                let _ = outbound.send(UnitMessage::EmbeddingsInfo { count: table.len() });
                Ok(Rc::new(table))
            })
            .await
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("model panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("model panicked: {}", s)
    } else {
        "model panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tts::testing::{EchoLoader, embedding_bytes, next_terminal, serve_bytes};
    use std::io::Cursor;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn spawn_unit(loader: Arc<EchoLoader>, voices: usize) -> UnitHandle {
        let source = EmbeddingSource::Memory(embedding_bytes(voices).into());
        ThreadSpawner::new(loader, source).spawn().unwrap()
    }

    fn speak(handle: &UnitHandle, request_id: u64, text: &str, speaker_index: usize) {
        handle.requests.send(UnitRequest::Speak { request_id, text: text.to_string(), speaker_index }).unwrap();
    }

    fn first_sample(buffer: &[u8]) -> i16 {
        let mut reader = hound::WavReader::new(Cursor::new(buffer.to_vec())).unwrap();
        reader.samples::<i16>().next().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_speak_reports_voices_and_completes() {
        let loader = Arc::new(EchoLoader::default());
        let mut handle = spawn_unit(loader.clone(), 3);

        speak(&handle, 1, "Hello there", 2);

        let mut saw_count = None;
        let mut saw_progress = false;
        let reply = loop {
            let message = tokio::time::timeout(Duration::from_secs(10), handle.messages.recv()).await.unwrap().unwrap();
            match message {
                UnitMessage::EmbeddingsInfo { count } => saw_count = Some(count),
                UnitMessage::Progress(_) => saw_progress = true,
                other => break other,
            }
        };

        assert_eq!(saw_count, Some(3));
        assert!(saw_progress);
        let UnitMessage::Complete { request_id, buffer } = reply else { panic!("expected completion, got {:?}", reply) };
        assert_eq!(request_id, 1);
        assert_eq!(first_sample(&buffer), (0.2f32 * 32767.0) as i16);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    /// Collect messages until `terminals` replies arrived, counting voice-count reports.
    async fn drain_replies(handle: &mut UnitHandle, terminals: usize) -> (Vec<u64>, usize) {
        let mut completed = Vec::new();
        let mut infos = 0;
        while completed.len() < terminals {
            let message = tokio::time::timeout(Duration::from_secs(10), handle.messages.recv()).await.unwrap().unwrap();
            match message {
                UnitMessage::EmbeddingsInfo { .. } => infos += 1,
                UnitMessage::Complete { request_id, .. } => completed.push(request_id),
                UnitMessage::Error { message, .. } => panic!("unexpected error: {}", message),
                UnitMessage::Progress(_) => {}
            }
        }
        completed.sort();
        (completed, infos)
    }

    #[tokio::test]
    async fn test_embeddings_fetched_and_announced_once() {
        let (url, hits) = serve_bytes(embedding_bytes(3)).await;
        let mut handle = ThreadSpawner::new(Arc::new(EchoLoader::default()), EmbeddingSource::Url(url)).spawn().unwrap();

        // Three requests queued before anything is loaded.
        for request_id in 1..=3 {
            speak(&handle, request_id, "queued", 1);
        }
        let (completed, infos) = drain_replies(&mut handle, 3).await;
        assert_eq!(completed, vec![1, 2, 3]);
        assert_eq!(infos, 1);

        // A later request reuses the cached table.
        speak(&handle, 4, "later", 2);
        let (completed, infos) = drain_replies(&mut handle, 1).await;
        assert_eq!(completed, vec![4]);
        assert_eq!(infos, 0);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_speaker_uses_first_voice() {
        let mut handle = spawn_unit(Arc::new(EchoLoader::default()), 2);

        speak(&handle, 1, "Hello", 9);
        let UnitMessage::Complete { buffer, .. } = next_terminal(&mut handle.messages).await else { panic!("expected completion") };
        assert_eq!(first_sample(&buffer), 0);
    }

    #[tokio::test]
    async fn test_model_load_failure_is_retried() {
        let loader = Arc::new(EchoLoader { fail_first: true, ..Default::default() });
        let mut handle = spawn_unit(loader.clone(), 1);

        speak(&handle, 1, "first", 0);
        match next_terminal(&mut handle.messages).await {
            UnitMessage::Error { request_id, message } => {
                assert_eq!(request_id, Some(1));
                assert!(message.contains("speech model"), "{}", message);
            }
            other => panic!("expected error, got {:?}", other),
        }

        speak(&handle, 2, "second", 0);
        assert!(matches!(next_terminal(&mut handle.messages).await, UnitMessage::Complete { request_id: 2, .. }));
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_model_load() {
        let loader = Arc::new(EchoLoader { delay: Duration::from_millis(100), ..Default::default() });
        let mut handle = spawn_unit(loader.clone(), 1);

        speak(&handle, 1, "one", 0);
        speak(&handle, 2, "two", 0);

        let mut completed = vec![next_terminal(&mut handle.messages).await.request_id(), next_terminal(&mut handle.messages).await.request_id()];
        completed.sort();
        assert_eq!(completed, vec![Some(1), Some(2)]);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unit_survives_model_panic() {
        let mut handle = spawn_unit(Arc::new(EchoLoader::default()), 1);

        speak(&handle, 1, EchoLoader::PANIC_TEXT, 0);
        match next_terminal(&mut handle.messages).await {
            UnitMessage::Error { message, .. } => assert!(message.contains("model panicked"), "{}", message),
            other => panic!("expected error, got {:?}", other),
        }

        speak(&handle, 2, "still alive", 0);
        assert!(matches!(next_terminal(&mut handle.messages).await, UnitMessage::Complete { request_id: 2, .. }));
    }

    #[tokio::test]
    async fn test_invalid_embeddings_are_reported() {
        let source = EmbeddingSource::Memory(vec![0u8; 64].into());
        let mut handle = ThreadSpawner::new(Arc::new(EchoLoader::default()), source).spawn().unwrap();

        speak(&handle, 1, "Hello", 0);
        match next_terminal(&mut handle.messages).await {
            UnitMessage::Error { message, .. } => assert!(message.contains("unexpectedly small"), "{}", message),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_unit() {
        let mut handle = spawn_unit(Arc::new(EchoLoader::default()), 1);
        handle.shutdown.cancel();

        // Every sender lives on the unit thread, so the channel closes once it exits.
        let closed = tokio::time::timeout(Duration::from_secs(10), handle.messages.recv()).await.unwrap();
        assert!(closed.is_none());
        handle.thread.take().unwrap().join().unwrap();
    }
}
