//! Stream Content Store
//!
//! Session-scoped registry mapping a lesson key to the text accumulated by
//! its current generation, plus the subscribers watching it. The store is
//! deliberately decoupled from any UI lifecycle: a generation may outlive the
//! view that started it, and a view mounted later must be able to pick up
//! in-progress content.
//!
//! # Design Philosophy
//!
//! The store is a shared service, not ambient global state. Handles are cheap
//! clones over an `Arc`, so the queue, the stream runner, and any number of
//! readers can hold one. Writers are single-owner per key for the lifetime of
//! one generation (enforced by the runner's active set); readers are
//! unordered and side-effect-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Lesson Key
// ============================================================================

/// Stable identity of one piece of generated lesson content
///
/// Opaque to this crate; callers typically use a lesson id or a composite
/// like `"course:12/lesson:3"`. One key maps to one content buffer and at
/// most one live queue entry at a time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LessonKey(pub String);

impl LessonKey {
    /// Create a new lesson key from a string
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LessonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for LessonKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for LessonKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

// ============================================================================
// Content Store
// ============================================================================

/// Callback invoked with the full current content after every change
pub type ContentCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One store slot: accumulated text plus its subscribers
#[derive(Default)]
struct StoreEntry {
    content: String,
    subscribers: Vec<(u64, ContentCallback)>,
}

/// Keyed registry of streamed content and subscribers
///
/// Entries are created lazily on first reference and live until explicitly
/// cleared. Cloning the store clones the handle, not the data.
#[derive(Clone, Default)]
pub struct ContentStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    entries: DashMap<LessonKey, StoreEntry>,
    next_subscriber_id: AtomicU64,
}

impl ContentStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current content for a key ("" if nothing has been written)
    #[must_use]
    pub fn content(&self, key: &LessonKey) -> String {
        self.inner
            .entries
            .get(key)
            .map(|entry| entry.content.clone())
            .unwrap_or_default()
    }

    /// Check whether an entry exists for the key
    #[must_use]
    pub fn contains(&self, key: &LessonKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Number of subscribers currently registered for a key
    #[must_use]
    pub fn subscriber_count(&self, key: &LessonKey) -> usize {
        self.inner
            .entries
            .get(key)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Register a callback invoked with the full content on every change
    ///
    /// The callback is invoked once immediately with the current snapshot, so
    /// a late subscriber sees in-progress content without waiting for the
    /// next flush. Safe to call before, during, or after a stream exists for
    /// the key. The returned [`Subscription`] unsubscribes on drop.
    pub fn subscribe(
        &self,
        key: &LessonKey,
        callback: impl Fn(&str) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let callback: ContentCallback = Arc::new(callback);

        let current = {
            let mut entry = self.inner.entries.entry(key.clone()).or_default();
            entry.subscribers.push((id, callback.clone()));
            entry.content.clone()
        };

        tracing::debug!(key = %key, subscriber = id, "content subscriber registered");
        callback(&current);

        Subscription {
            store: self.clone(),
            key: key.clone(),
            id,
        }
    }

    /// Remove the entry for a key entirely
    ///
    /// Used on explicit reset, not on normal completion. Existing
    /// subscriptions for the key become inert until the key is referenced
    /// again (their disposer remains safe to drop).
    pub fn clear(&self, key: &LessonKey) {
        self.inner.entries.remove(key);
        tracing::debug!(key = %key, "content entry cleared");
    }

    /// Reset content to "" for a new generation and notify subscribers
    ///
    /// Called before any network activity so stale text from a previous
    /// generation is never shown as if it were the new stream's output.
    pub(crate) fn begin(&self, key: &LessonKey) {
        self.mutate(key, String::clear);
    }

    /// Append flushed text and notify subscribers with the full content
    pub(crate) fn append(&self, key: &LessonKey, text: &str) {
        self.mutate(key, |content| content.push_str(text));
    }

    /// Apply a content mutation, then invoke subscribers outside the shard
    /// lock so a callback may re-enter the store.
    fn mutate(&self, key: &LessonKey, f: impl FnOnce(&mut String)) {
        let (subscribers, content) = {
            let mut entry = self.inner.entries.entry(key.clone()).or_default();
            f(&mut entry.content);
            let subscribers: Vec<ContentCallback> = entry
                .subscribers
                .iter()
                .map(|(_, callback)| callback.clone())
                .collect();
            (subscribers, entry.content.clone())
        };

        for callback in subscribers {
            callback(&content);
        }
    }

    fn unsubscribe(&self, key: &LessonKey, id: u64) {
        if let Some(mut entry) = self.inner.entries.get_mut(key) {
            entry.subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
        tracing::debug!(key = %key, subscriber = id, "content subscriber removed");
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// RAII handle for a content subscription; unsubscribes on drop
pub struct Subscription {
    store: ContentStore,
    key: LessonKey,
    id: u64,
}

impl Subscription {
    /// The key this subscription watches
    #[must_use]
    pub fn key(&self) -> &LessonKey {
        &self.key
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.unsubscribe(&self.key, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
