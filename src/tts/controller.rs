//! Caller-facing controller for the synthesis unit.
//!
//! The controller owns at most one unit, sends it one `speak` message per
//! [`Controller::generate`] call and waits for the matching reply under a timeout.
//! Unit broadcasts (progress, voice count, errors) are fanned out to subscribers.
//! Failures never surface as `Err`: every failing call yields `None` and notifies
//! the error subscribers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clip::AudioClip;
use super::model::LoadProgress;
use super::protocol::{UnitMessage, UnitRequest};
use super::subscribers::{Subscribers, Subscription};
use super::unit::UnitSpawner;
use crate::config::ControllerConfig;
use crate::error::TtsError;

/// Terminal outcome delivered to a waiting `generate` call.
enum Reply {
    Audio(Vec<u8>),
    Failed(String),
}

/// State shared between the controller and its dispatcher task.
struct Shared {
    progress: Arc<Subscribers<LoadProgress>>,
    errors: Arc<Subscribers<str>>,
    voice_counts: Arc<Subscribers<usize>>,
    known_voice_count: AtomicUsize,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>, // request id -> waiting call
}

impl Shared {
    fn notify_error(&self, message: &str) {
        self.errors.emit(message);
    }

    /// Hand a terminal reply to its waiting call, if it is still waiting.
    fn resolve(&self, request_id: u64, reply: Reply) {
        match self.pending.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("Ignoring reply for request {} (no longer waiting)", request_id),
        }
    }
}

/// Controller-side link to a running unit.
struct UnitLink {
    requests: mpsc::UnboundedSender<UnitRequest>,
    shutdown: CancellationToken,
    dispatcher: JoinHandle<()>,
    thread: Option<thread::JoinHandle<()>>,
}

impl UnitLink {
    /// The link is usable while its dispatcher is still routing replies.
    fn is_alive(&self) -> bool {
        !self.dispatcher.is_finished()
    }

    fn terminate(self) {
        self.shutdown.cancel();
        self.dispatcher.abort();
        drop(self.requests);
        // The unit thread may be mid-inference; it exits on its own once it sees the cancellation.
        if let Some(thread) = self.thread {
            debug!("Detached unit thread {:?}", thread.thread().name());
        }
    }
}

/// Removes a call's listener on every exit path, including the caller dropping the future.
struct PendingGuard<'a> {
    shared: &'a Shared,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.request_id);
    }
}

/// Speech synthesis controller.
pub struct Controller {
    spawner: Arc<dyn UnitSpawner>,
    config: ControllerConfig,
    shared: Arc<Shared>,
    unit: Mutex<Option<UnitLink>>,
    selected_speaker_index: AtomicUsize,
    next_request_id: AtomicU64,
}

impl Controller {
    /// Create a controller with the default configuration. No unit is started yet.
    pub fn new(spawner: Arc<dyn UnitSpawner>) -> Self {
        Self::with_config(spawner, ControllerConfig::default())
    }

    pub fn with_config(spawner: Arc<dyn UnitSpawner>, config: ControllerConfig) -> Self {
        Self {
            spawner,
            config,
            shared: Arc::new(Shared {
                progress: Subscribers::new(),
                errors: Subscribers::new(),
                voice_counts: Subscribers::new(),
                known_voice_count: AtomicUsize::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
            unit: Mutex::new(None),
            selected_speaker_index: AtomicUsize::new(0),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Start the synthesis unit if it is not running.
    ///
    /// Idempotent. Returns `false` if construction failed; nothing is kept in that
    /// case, so a later call retries from scratch. Must be called from within a
    /// tokio runtime.
    pub fn init(&self) -> bool {
        match self.try_init() {
            Ok(()) => true,
            Err(e) => {
                error!("❌ Failed to initialize TTS unit: {}", e);
                false
            }
        }
    }

    fn try_init(&self) -> Result<(), TtsError> {
        let mut unit = self.unit.lock();
        match unit.take() {
            Some(link) if link.is_alive() => {
                *unit = Some(link);
                return Ok(());
            }
            Some(link) => {
                warn!("TTS unit stopped unexpectedly, starting a new one");
                link.terminate();
            }
            None => {}
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| TtsError::Initialization(e.to_string()))?;

        info!("Initializing TTS unit...");
        let handle = self.spawner.spawn()?;
        let dispatcher = runtime.spawn(dispatch(self.shared.clone(), handle.messages));

        *unit = Some(UnitLink { requests: handle.requests, shutdown: handle.shutdown, dispatcher, thread: handle.thread });
        Ok(())
    }

    /// Synthesize `text`, returning a playable clip or `None` on any failure.
    ///
    /// Uses `speaker_index` if given, else the index set by
    /// [`Controller::set_speaker_index`]. Resolves within the configured timeout.
    pub async fn generate(&self, text: &str, speaker_index: Option<usize>) -> Option<AudioClip> {
        if let Err(e) = self.try_init() {
            error!("❌ TTS unit not initialized: {}", e);
            self.shared.notify_error(&e.to_string());
            return None;
        }

        let speaker_index = speaker_index.unwrap_or_else(|| self.selected_speaker_index());
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(request_id, tx);
        let _listener = PendingGuard { shared: &self.shared, request_id };

        let sent = self
            .unit
            .lock()
            .as_ref()
            .is_some_and(|link| link.is_alive() && link.requests.send(UnitRequest::Speak { request_id, text: text.to_string(), speaker_index }).is_ok());
        if !sent {
            self.fail(request_id, TtsError::UnitClosed);
            return None;
        }

        debug!("Request {} sent (speaker {})", request_id, speaker_index);

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(Reply::Audio(buffer))) => match AudioClip::from_wav(buffer) {
                Ok(clip) => {
                    info!("🔊 Audio generated for request {} ({} bytes)", request_id, clip.len());
                    Some(clip)
                }
                Err(e) => {
                    self.fail(request_id, e);
                    None
                }
            },
            Ok(Ok(Reply::Failed(message))) => {
                // Already forwarded to the error subscribers by the dispatcher.
                warn!("Request {} failed: {}", request_id, message);
                None
            }
            Ok(Err(_)) => {
                self.fail(request_id, TtsError::UnitClosed);
                None
            }
            Err(_) => {
                self.fail(request_id, TtsError::Timeout(self.config.timeout));
                None
            }
        }
    }

    fn fail(&self, request_id: u64, err: TtsError) {
        error!("❌ Request {} failed: {}", request_id, err);
        self.shared.notify_error(&err.to_string());
    }

    /// Set the default voice for calls without an explicit index. Not validated here.
    pub fn set_speaker_index(&self, index: usize) {
        self.selected_speaker_index.store(index, Ordering::Relaxed);
    }

    pub fn selected_speaker_index(&self) -> usize {
        self.selected_speaker_index.load(Ordering::Relaxed)
    }

    /// Subscribe to model-load progress.
    pub fn on_progress(&self, callback: impl Fn(&LoadProgress) + Send + Sync + 'static) -> Subscription {
        self.shared.progress.add(callback)
    }

    /// Subscribe to human-readable error messages.
    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> Subscription {
        self.shared.errors.add(callback)
    }

    /// Subscribe to voice-count reports.
    ///
    /// If a count is already known the callback is invoked with it right away.
    pub fn on_voice_count(&self, callback: impl Fn(&usize) + Send + Sync + 'static) -> Subscription {
        let callback = Arc::new(callback);
        let subscriber = callback.clone();
        let subscription = self.shared.voice_counts.add(move |count: &usize| subscriber(count));

        // Registered first, so a report racing with this call is not lost.
        let known = self.voice_count();
        if known > 0 {
            callback(&known);
        }
        subscription
    }

    /// Last voice count reported by the unit; 0 while unknown.
    pub fn voice_count(&self) -> usize {
        self.shared.known_voice_count.load(Ordering::Relaxed)
    }

    /// Whether a unit is running.
    pub fn is_ready(&self) -> bool {
        self.unit.lock().as_ref().is_some_and(UnitLink::is_alive)
    }

    /// Tear everything down: stop the unit, drop all subscribers, zero the counters.
    ///
    /// Calls still waiting resolve to `None`.
    pub fn reset(&self) {
        if let Some(link) = self.unit.lock().take() {
            link.terminate();
            info!("TTS unit terminated");
        }

        self.shared.progress.clear();
        self.shared.errors.clear();
        self.shared.voice_counts.clear();
        self.shared.pending.lock().clear();
        self.shared.known_voice_count.store(0, Ordering::Relaxed);
        self.selected_speaker_index.store(0, Ordering::Relaxed);
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(link) = self.unit.get_mut().take() {
            link.terminate();
        }
    }
}

/// Route unit messages: broadcasts to subscribers, terminal replies to their call.
async fn dispatch(shared: Arc<Shared>, mut messages: mpsc::UnboundedReceiver<UnitMessage>) {
    while let Some(message) = messages.recv().await {
        match message {
            UnitMessage::EmbeddingsInfo { count } => {
                info!("🗣️  {} voice(s) available", count);
                shared.known_voice_count.store(count, Ordering::Relaxed);
                shared.voice_counts.emit(&count);
            }
            UnitMessage::Progress(progress) => {
                debug!("Loading model: {} - {}% ({})", progress.file.as_deref().unwrap_or("-"), progress.percent, progress.status);
                shared.progress.emit(&progress);
            }
            UnitMessage::Error { request_id, message } => {
                shared.notify_error(&message);
                if let Some(request_id) = request_id {
                    shared.resolve(request_id, Reply::Failed(message));
                }
            }
            UnitMessage::Complete { request_id, buffer } => shared.resolve(request_id, Reply::Audio(buffer)),
        }
    }
    debug!("Unit message channel closed");

    // No reply can arrive any more; waiting calls resolve now instead of at their timeout.
    let orphaned = std::mem::take(&mut *shared.pending.lock());
    if !orphaned.is_empty() {
        warn!("Unit stopped with {} request(s) in flight", orphaned.len());
    }
}
