//! Stream Runner
//!
//! Executes exactly one long-running streaming read for a given lesson key:
//! resets the content store entry, opens the backend stream, decodes and
//! buffers text, and flushes accumulated output into the store on a fixed
//! interval so high-frequency chunk arrivals become UI-friendly update ticks
//! instead of one notification per chunk.
//!
//! A module-level active set guards against two concurrent streams for the
//! same key. The guard sits below the queue's own duplicate check, so even a
//! caller that bypasses the queue cannot start a second writer for a key.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{ContentBackend, GenerationRequest, StreamChunk};
use crate::store::{ContentStore, LessonKey};

/// Lower bound for the flush period (a zero interval would spin)
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// Runner Contract
// ============================================================================

/// Lifecycle callbacks for one stream run
///
/// The queue implements this to observe transitions; all failure modes are
/// converted into exactly one terminal callback, nothing escapes as a panic
/// or unhandled error.
pub trait RunnerEvents: Send + Sync {
    /// The response arrived with a success status; bytes are now streaming.
    /// Invoked exactly once, and only on runs that reach the read loop.
    fn on_started(&self, key: &LessonKey);

    /// The stream ended cleanly: natural end-of-stream, or user cancellation
    /// (cancellation is explicitly not a failure)
    fn on_done(&self, key: &LessonKey);

    /// The stream failed; `message` is user-facing
    fn on_error(&self, key: &LessonKey, message: &str);
}

/// How one run terminated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Natural end-of-stream after a final flush
    Completed,
    /// Aborted via the cancellation token; reported as done, not as error
    Cancelled,
    /// Open-time or mid-stream failure, reported through `on_error`
    Failed,
    /// Another stream was already active for this key; silent no-op
    Skipped,
}

// ============================================================================
// Stream Runner
// ============================================================================

/// Drives streaming reads into the content store, one writer per key
pub struct StreamRunner {
    store: ContentStore,
    backend: Arc<dyn ContentBackend>,
    active: Mutex<HashSet<LessonKey>>,
    flush_interval: Duration,
}

impl StreamRunner {
    /// Create a runner writing into `store` through `backend`
    #[must_use]
    pub fn new(store: ContentStore, backend: Arc<dyn ContentBackend>, flush_interval: Duration) -> Self {
        Self {
            store,
            backend,
            active: Mutex::new(HashSet::new()),
            flush_interval: flush_interval.max(MIN_FLUSH_INTERVAL),
        }
    }

    /// Whether a stream is currently running for the key
    #[must_use]
    pub fn is_active(&self, key: &LessonKey) -> bool {
        self.active.lock().contains(key)
    }

    /// Run one generation stream for `key` to completion
    ///
    /// Preconditions: no other active stream for the same key; a concurrent
    /// duplicate returns [`StreamOutcome::Skipped`] without touching the
    /// store. The key leaves the active set on every exit path, so it becomes
    /// eligible for a future stream regardless of how this one ends.
    pub async fn run(
        &self,
        key: &LessonKey,
        request: &GenerationRequest,
        cancel: CancellationToken,
        events: &dyn RunnerEvents,
    ) -> StreamOutcome {
        if !self.active.lock().insert(key.clone()) {
            tracing::debug!(key = %key, "stream already active for key, skipping duplicate run");
            return StreamOutcome::Skipped;
        }
        let _slot = ActiveSlot { runner: self, key };

        // Clear stale text before any network activity so subscribers never
        // see a previous generation's output as this one's
        self.store.begin(key);

        let mut chunks = tokio::select! {
            result = self.backend.open_stream(request) => match result {
                Ok(rx) => rx,
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(key = %key, error = %message, "stream request failed");
                    events.on_error(key, &message);
                    return StreamOutcome::Failed;
                }
            },
            () = cancel.cancelled() => {
                tracing::debug!(key = %key, "stream cancelled before response");
                events.on_done(key);
                return StreamOutcome::Cancelled;
            }
        };

        tracing::debug!(key = %key, backend = self.backend.name(), "stream started");
        events.on_started(key);

        let mut buffer = String::new();
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.flush_interval,
            self.flush_interval,
        );

        loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(StreamChunk::Text(text)) => buffer.push_str(&text),
                    Some(StreamChunk::Error(message)) => {
                        // Keep the partial content already received
                        self.flush(key, &mut buffer);
                        tracing::warn!(key = %key, error = %message, "stream failed mid-read");
                        events.on_error(key, &message);
                        return StreamOutcome::Failed;
                    }
                    None => {
                        self.flush(key, &mut buffer);
                        tracing::debug!(key = %key, "stream completed");
                        events.on_done(key);
                        return StreamOutcome::Completed;
                    }
                },
                _ = ticker.tick() => self.flush(key, &mut buffer),
                () = cancel.cancelled() => {
                    // Unflushed remainder is discarded: the generation was
                    // abandoned, no further writes land in the store
                    tracing::debug!(key = %key, "stream cancelled");
                    events.on_done(key);
                    return StreamOutcome::Cancelled;
                }
            }
        }
    }

    fn flush(&self, key: &LessonKey, buffer: &mut String) {
        if buffer.is_empty() {
            return;
        }
        let text = std::mem::take(buffer);
        self.store.append(key, &text);
    }
}

/// Removes the key from the active set when the run exits, on every path
struct ActiveSlot<'a> {
    runner: &'a StreamRunner,
    key: &'a LessonKey,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.runner.active.lock().remove(self.key);
    }
}
