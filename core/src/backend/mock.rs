//! Scripted Test Backend
//!
//! Mock infrastructure for exercising the queue and runner without network
//! calls. Tests register a scripted stream (or an open-time error) per URL
//! ahead of time, then drive chunks, failure, or completion by hand.
//!
//! # Usage
//!
//! ```ignore
//! use courseflow_core::backend::{GenerationRequest, ScriptedBackend};
//!
//! let backend = ScriptedBackend::new();
//! let script = backend.script("mock://lesson/a");
//!
//! // ... enqueue work that opens "mock://lesson/a" ...
//!
//! script.push("first chunk").await;
//! script.complete();
//! assert_eq!(backend.open_count("mock://lesson/a"), 1);
//! ```

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{BackendError, ContentBackend, GenerationRequest, StreamChunk};

/// One pre-registered response for a URL
enum ScriptEntry {
    /// Hand-driven chunk stream
    Stream(mpsc::Receiver<StreamChunk>),
    /// Error returned from `open_stream` itself
    OpenError(BackendError),
}

// ============================================================================
// Scripted Backend
// ============================================================================

/// Content backend that replays test-scripted streams
///
/// Scripts are consumed in registration order per URL. Opening a URL with
/// no remaining script yields an immediately-complete empty stream, so
/// incidental opens never hang a test.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<ScriptEntry>>>,
    open_counts: Mutex<HashMap<String, usize>>,
}

impl ScriptedBackend {
    /// Create a backend with no scripts
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hand-driven stream for the next open of `url`
    #[must_use]
    pub fn script(&self, url: &str) -> StreamScript {
        let (tx, rx) = mpsc::channel(64);
        self.scripts
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(ScriptEntry::Stream(rx));
        StreamScript { tx }
    }

    /// Register an open-time error for the next open of `url`
    pub fn script_error(&self, url: &str, error: BackendError) {
        self.scripts
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(ScriptEntry::OpenError(error));
    }

    /// How many times `url` has been opened
    #[must_use]
    pub fn open_count(&self, url: &str) -> usize {
        self.open_counts.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ContentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, BackendError> {
        *self
            .open_counts
            .lock()
            .entry(request.url.clone())
            .or_insert(0) += 1;

        let entry = self
            .scripts
            .lock()
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front);

        match entry {
            Some(ScriptEntry::Stream(rx)) => Ok(rx),
            Some(ScriptEntry::OpenError(error)) => Err(error),
            None => {
                // Unscripted open: empty, already-complete stream
                let (_tx, rx) = mpsc::channel(1);
                Ok(rx)
            }
        }
    }
}

// ============================================================================
// Stream Script
// ============================================================================

/// Driver handle for one scripted stream
pub struct StreamScript {
    tx: mpsc::Sender<StreamChunk>,
}

impl StreamScript {
    /// Deliver a text chunk; returns false once the stream was cancelled
    /// (the consumer dropped its receiver)
    pub async fn push(&self, text: &str) -> bool {
        self.tx
            .send(StreamChunk::Text(text.to_string()))
            .await
            .is_ok()
    }

    /// Deliver a mid-stream transport failure
    pub async fn fail(&self, message: &str) -> bool {
        self.tx
            .send(StreamChunk::Error(message.to_string()))
            .await
            .is_ok()
    }

    /// End the stream normally
    pub fn complete(self) {
        drop(self.tx);
    }

    /// Whether the consumer side is still attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        !self.tx.is_closed()
    }
}
