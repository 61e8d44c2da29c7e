//! Test doubles shared by the unit and controller tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::embeddings::{EMBEDDING_DIM, Speaker, to_le_bytes};
use super::model::{LoadStatus, ModelLoader, ProgressReporter, SpeechModel, Synthesis};
use super::protocol::{UnitMessage, UnitRequest};
use super::unit::{UnitHandle, UnitSpawner};
use crate::error::TtsError;

/// Embedding table bytes where every value of voice `v` is `v * 0.1`.
pub fn embedding_bytes(voices: usize) -> Vec<u8> {
    let values: Vec<f32> = (0..voices).flat_map(|v| std::iter::repeat_n(v as f32 * 0.1, EMBEDDING_DIM)).collect();
    to_le_bytes(&values)
}

/// Serve `body` over plain HTTP on localhost, counting requests.
///
/// Returns the URL to fetch and the hit counter.
pub async fn serve_bytes(body: Vec<u8>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/speaker_embeddings.bin", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));

    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let head = format!("HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", body.len());
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (url, hits)
}

/// Model that emits eight samples equal to the first embedding value.
pub struct EchoModel;

impl SpeechModel for EchoModel {
    fn synthesize(&mut self, text: &str, speaker: Speaker<'_>) -> Result<Synthesis> {
        if text == EchoLoader::PANIC_TEXT {
            panic!("echo model exploded");
        }
        anyhow::ensure!(!text.is_empty(), "empty text");
        Ok(Synthesis { samples: vec![speaker.embedding[0]; 8], sample_rate: 16000 })
    }
}

/// Loader for [`EchoModel`] that counts loads and can fail or stall.
#[derive(Default)]
pub struct EchoLoader {
    pub loads: AtomicUsize,
    pub fail_first: bool,
    pub delay: Duration,
}

impl EchoLoader {
    pub const PANIC_TEXT: &'static str = "__panic__";
}

impl ModelLoader for EchoLoader {
    fn load(&self, progress: &ProgressReporter) -> Result<Box<dyn SpeechModel>> {
        let attempt = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        progress.report(Some("echo.onnx"), 0, LoadStatus::Initiate);
        std::thread::sleep(self.delay);
        if self.fail_first && attempt == 1 {
            anyhow::bail!("network unavailable");
        }
        progress.report(Some("echo.onnx"), 100, LoadStatus::Done);
        Ok(Box::new(EchoModel))
    }
}

/// Wait for the next `complete` or `error` message, skipping broadcasts.
pub async fn next_terminal(messages: &mut mpsc::UnboundedReceiver<UnitMessage>) -> UnitMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), messages.recv())
            .await
            .expect("timed out waiting for unit reply")
            .expect("unit message channel closed");
        if matches!(message, UnitMessage::Complete { .. } | UnitMessage::Error { .. }) {
            return message;
        }
    }
}

/// Unit-side channel ends handed out by [`ScriptedSpawner`].
pub struct UnitEnds {
    pub requests: mpsc::UnboundedReceiver<UnitRequest>,
    pub messages: mpsc::UnboundedSender<UnitMessage>,
    pub shutdown: CancellationToken,
}

/// Spawner whose units are driven by the test itself.
#[derive(Default)]
pub struct ScriptedSpawner {
    failures_left: AtomicUsize,
    pub spawned: AtomicUsize,
    units: Mutex<Vec<UnitEnds>>,
}

impl ScriptedSpawner {
    /// Reject the first `failures` construction attempts.
    pub fn failing(failures: usize) -> Self {
        Self { failures_left: AtomicUsize::new(failures), ..Default::default() }
    }

    /// Take the ends of the most recently spawned unit.
    pub fn take_unit(&self) -> UnitEnds {
        self.units.lock().pop().expect("no unit spawned")
    }
}

impl UnitSpawner for ScriptedSpawner {
    fn spawn(&self) -> Result<UnitHandle, TtsError> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(TtsError::Initialization("worker construction rejected".to_string()));
        }

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        self.units.lock().push(UnitEnds { requests: request_rx, messages: message_tx, shutdown: shutdown.clone() });
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(UnitHandle::new(request_tx, message_rx, shutdown))
    }
}
