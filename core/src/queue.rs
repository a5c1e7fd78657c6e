//! Generation Queue
//!
//! Admission control over the stream runner: accepts enqueue requests keyed
//! by lesson identity, admits up to a fixed number of concurrent streams,
//! parks the rest in FIFO order, and re-asserts "fill free slots from the
//! queue" after every observable state transition. Callers that come and go
//! read per-key status and a derived visible-entry list; every mutation is
//! also published through a watch channel so progress UI can re-render from
//! snapshots instead of polling.
//!
//! # State machine
//!
//! `Queued → Generating → {Done | Error}`. Terminal states never re-enter
//! `Queued`; a retry is a fresh enqueue. `Done` entries are removed at the
//! completion transition and never surface externally.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::{ContentBackend, GenerationRequest};
use crate::config::GenerationConfig;
use crate::runner::{RunnerEvents, StreamOutcome, StreamRunner};
use crate::store::{ContentStore, LessonKey};

// ============================================================================
// Entry Status
// ============================================================================

/// Lifecycle state of one generation request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Waiting for a free slot, in FIFO order
    Queued,
    /// Admitted; the stream runner owns it
    Generating,
    /// Finished successfully (transient: the entry is removed immediately)
    Done,
    /// Failed; the message stays visible until removed or re-enqueued
    Error,
}

impl EntryStatus {
    /// Whether this status is terminal (no further transitions)
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether the entry counts against the admission ceiling
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Generating)
    }

    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Generating => "Generating",
            Self::Done => "Done",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Externally-visible view of one queue entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Identity of the content being generated
    pub key: LessonKey,
    /// Display label (not used for identity)
    pub title: String,
    /// Current lifecycle state (never `Done` in a visible list)
    pub status: EntryStatus,
    /// Failure message, present only when `status` is `Error`
    pub error: Option<String>,
    /// True once the response arrived and bytes are actually streaming
    /// (distinguishes "admitted" from "actively receiving")
    pub streaming: bool,
}

/// Snapshot of the visible queue, published after every mutation
///
/// This is the contract the queue status bar renders: entries in insertion
/// order, completed work already gone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Visible entries in insertion order
    pub entries: Vec<QueueEntry>,
}

// ============================================================================
// Internal State
// ============================================================================

/// Full bookkeeping for one entry, including what snapshots omit
struct EntryState {
    title: String,
    status: EntryStatus,
    error: Option<String>,
    streaming: bool,
    /// Distinguishes this entry from earlier or later entries for the same
    /// key; a runner's callbacks only apply while the epochs still match
    epoch: u64,
    /// Owned exclusively by this entry; aborts the in-flight read
    cancel: CancellationToken,
    /// Stored so the queue can self-start parked work later
    request: GenerationRequest,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<LessonKey, EntryState>,
    /// Insertion order; drives FIFO admission and snapshot ordering
    order: Vec<LessonKey>,
    /// Monotonic epoch source for new entries
    next_epoch: u64,
}

impl QueueState {
    fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status.is_active())
            .count()
    }

    fn generating_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.status == EntryStatus::Generating)
            .count()
    }

    fn remove(&mut self, key: &LessonKey) -> Option<EntryState> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(entry)
    }

    fn snapshot(&self) -> QueueSnapshot {
        let entries = self
            .order
            .iter()
            .filter_map(|key| {
                let entry = self.entries.get(key)?;
                if entry.status == EntryStatus::Done {
                    return None;
                }
                Some(QueueEntry {
                    key: key.clone(),
                    title: entry.title.clone(),
                    status: entry.status,
                    error: entry.error.clone(),
                    streaming: entry.streaming,
                })
            })
            .collect();
        QueueSnapshot { entries }
    }
}

/// Work selected for admission while the state lock was held
struct Admission {
    key: LessonKey,
    request: GenerationRequest,
    cancel: CancellationToken,
    epoch: u64,
}

// ============================================================================
// Generation Queue
// ============================================================================

/// Bounded-concurrency admission controller for generation streams
///
/// Clonable handle over shared state; all mutation happens under one mutex,
/// which plays the role the single-threaded event loop plays in a browser
/// runtime. Enqueue and removal must run inside a tokio runtime since
/// admitted work is spawned.
#[derive(Clone)]
pub struct GenerationQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: GenerationConfig,
    store: ContentStore,
    runner: StreamRunner,
    state: Mutex<QueueState>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
}

impl GenerationQueue {
    /// Create a queue with its own content store
    #[must_use]
    pub fn new(config: GenerationConfig, backend: Arc<dyn ContentBackend>) -> Self {
        Self::with_store(config, backend, ContentStore::new())
    }

    /// Create a queue writing into an existing store
    #[must_use]
    pub fn with_store(
        config: GenerationConfig,
        backend: Arc<dyn ContentBackend>,
        store: ContentStore,
    ) -> Self {
        let runner = StreamRunner::new(store.clone(), backend, config.flush_interval);
        let (snapshot_tx, _) = watch::channel(QueueSnapshot::default());
        Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                runner,
                state: Mutex::new(QueueState::default()),
                snapshot_tx,
            }),
        }
    }

    /// The content store this queue's streams write into
    #[must_use]
    pub fn store(&self) -> &ContentStore {
        &self.inner.store
    }

    /// Watch queue snapshots; a new one is published after every mutation
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Request generation for a lesson
    ///
    /// Returns `false` without side effects when an entry for `key` is
    /// already queued or generating (idempotent duplicate), or when the
    /// number of active entries has reached the admission ceiling. An
    /// existing terminal entry is discarded first, so re-enqueueing a failed
    /// or finished lesson regenerates it. Returns `true` once the entry is
    /// created; admission itself may happen now or when a slot frees.
    pub fn enqueue(
        &self,
        key: &LessonKey,
        title: impl Into<String>,
        request: GenerationRequest,
    ) -> bool {
        let admissions = {
            let mut state = self.inner.state.lock();

            if let Some(existing) = state.entries.get(key) {
                if existing.status.is_active() {
                    tracing::debug!(key = %key, status = %existing.status, "enqueue ignored, entry already active");
                    return false;
                }
                // Terminal entry: discard and regenerate
                existing.cancel.cancel();
                state.remove(key);
            }

            if state.active_count() >= self.inner.config.max_active {
                tracing::debug!(
                    key = %key,
                    ceiling = self.inner.config.max_active,
                    "enqueue rejected, admission ceiling reached"
                );
                return false;
            }

            state.next_epoch += 1;
            let epoch = state.next_epoch;
            state.entries.insert(
                key.clone(),
                EntryState {
                    title: title.into(),
                    status: EntryStatus::Queued,
                    error: None,
                    streaming: false,
                    epoch,
                    cancel: CancellationToken::new(),
                    request,
                },
            );
            state.order.push(key.clone());
            tracing::info!(key = %key, "generation enqueued");

            let admissions = self.inner.pump(&mut state);
            self.inner.publish(&state);
            admissions
        };

        self.inner.spawn_admissions(admissions);
        true
    }

    /// Current status for a key, if an entry exists
    #[must_use]
    pub fn status(&self, key: &LessonKey) -> Option<EntryStatus> {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.status)
    }

    /// The cancellation token owned by the entry for `key`, if any
    #[must_use]
    pub fn cancellation_token(&self, key: &LessonKey) -> Option<CancellationToken> {
        self.inner
            .state
            .lock()
            .entries
            .get(key)
            .map(|entry| entry.cancel.clone())
    }

    /// Cancel and delete the entry for `key`, regardless of state
    ///
    /// Aborts the underlying network read (not just the UI row) and frees
    /// the slot for the next queued entry.
    pub fn remove(&self, key: &LessonKey) {
        let admissions = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.remove(key) else {
                return;
            };
            entry.cancel.cancel();
            tracing::info!(key = %key, status = %entry.status, "generation removed");

            let admissions = self.inner.pump(&mut state);
            self.inner.publish(&state);
            admissions
        };

        self.inner.spawn_admissions(admissions);
    }

    /// Entries visible to progress UI, in insertion order (`Done` excluded)
    #[must_use]
    pub fn visible_entries(&self) -> Vec<QueueEntry> {
        self.inner.state.lock().snapshot().entries
    }

    /// Number of entries counting against the admission ceiling
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active_count()
    }

    /// Whether the queue holds no entries at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().entries.is_empty()
    }
}

impl QueueInner {
    /// Fill free streaming slots from the waiting set, earliest first
    ///
    /// Runs under the state lock after every transition: enqueue, stream
    /// completion, stream failure, and removal. Selected entries are marked
    /// `Generating` here; the actual work is spawned after the lock drops.
    fn pump(&self, state: &mut QueueState) -> Vec<Admission> {
        let mut admissions = Vec::new();

        while state.generating_count() < self.config.max_streaming {
            let next = state.order.iter().find(|key| {
                state
                    .entries
                    .get(*key)
                    .is_some_and(|entry| entry.status == EntryStatus::Queued)
            });
            let Some(key) = next.cloned() else {
                break;
            };
            let Some(entry) = state.entries.get_mut(&key) else {
                break;
            };
            entry.status = EntryStatus::Generating;
            tracing::info!(key = %key, "generation admitted");

            admissions.push(Admission {
                key,
                request: entry.request.clone(),
                cancel: entry.cancel.clone(),
                epoch: entry.epoch,
            });
        }

        admissions
    }

    fn spawn_admissions(self: &Arc<Self>, admissions: Vec<Admission>) {
        for admission in admissions {
            let events = QueueEvents {
                inner: self.clone(),
                epoch: admission.epoch,
            };
            tokio::spawn(async move {
                loop {
                    let outcome = events
                        .inner
                        .runner
                        .run(
                            &admission.key,
                            &admission.request,
                            admission.cancel.clone(),
                            &events,
                        )
                        .await;
                    if outcome != StreamOutcome::Skipped {
                        tracing::debug!(key = %admission.key, ?outcome, "stream finished");
                        break;
                    }
                    // A predecessor run for this key still holds the slot.
                    // It is already unwinding (its entry is gone), so let it
                    // finish and try again, unless this admission was itself
                    // superseded in the meantime.
                    tokio::task::yield_now().await;
                    if !events.inner.is_admitted(&admission.key, admission.epoch) {
                        tracing::debug!(key = %admission.key, "superseded admission dropped");
                        break;
                    }
                }
            });
        }
    }

    fn is_admitted(&self, key: &LessonKey, epoch: u64) -> bool {
        self.state.lock().entries.get(key).is_some_and(|entry| {
            entry.epoch == epoch && entry.status == EntryStatus::Generating
        })
    }

    fn publish(&self, state: &QueueState) {
        self.snapshot_tx.send_replace(state.snapshot());
    }
}

/// Bridges runner callbacks back into queue transitions
///
/// Owns a strong handle so completion of a stream can pump the queue and
/// spawn the next admission even after every external `GenerationQueue`
/// clone is gone. Carries the epoch of the entry it was spawned for: a
/// removed entry's runner exits asynchronously, and by the time its terminal
/// callback lands the key may already belong to a re-enqueued successor.
/// Epoch-mismatched callbacks are ignored so a stale shutdown can never
/// delete or fail the live entry.
struct QueueEvents {
    inner: Arc<QueueInner>,
    epoch: u64,
}

impl QueueEvents {
    fn is_current(&self, entry: &EntryState) -> bool {
        entry.epoch == self.epoch
    }
}

impl RunnerEvents for QueueEvents {
    fn on_started(&self, key: &LessonKey) {
        let state = &mut *self.inner.state.lock();
        if let Some(entry) = state.entries.get_mut(key) {
            if self.is_current(entry) {
                entry.streaming = true;
                self.inner.publish(state);
            }
        }
    }

    fn on_done(&self, key: &LessonKey) {
        let admissions = {
            let mut state = self.inner.state.lock();
            // A removed entry's cancelled runner lands here after its entry
            // is gone (or after its key was re-enqueued); nothing to do
            if !state.entries.get(key).is_some_and(|e| self.is_current(e)) {
                tracing::debug!(key = %key, "stale stream completion ignored");
                return;
            }
            state.remove(key);
            tracing::info!(key = %key, "generation done");
            let admissions = self.inner.pump(&mut state);
            self.inner.publish(&state);
            admissions
        };

        self.inner.spawn_admissions(admissions);
    }

    // Mid-stream failures arrive here with partial content already flushed
    fn on_error(&self, key: &LessonKey, message: &str) {
        let admissions = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.entries.get_mut(key) else {
                return;
            };
            if !self.is_current(entry) {
                tracing::debug!(key = %key, "stale stream failure ignored");
                return;
            }
            entry.status = EntryStatus::Error;
            entry.error = Some(message.to_string());
            entry.streaming = false;
            tracing::warn!(key = %key, error = %message, "generation failed");
            let admissions = self.inner.pump(&mut state);
            self.inner.publish(&state);
            admissions
        };

        self.inner.spawn_admissions(admissions);
    }
}

// ============================================================================
// Tests
// ============================================================================
