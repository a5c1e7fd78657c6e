//! Integration tests for the generation pipeline
//!
//! These tests drive a full queue (admission, runner, store) against a
//! scripted backend and verify the end-to-end behavioral contract:
//! - At most `max_streaming` streams are ever open at once
//! - Queued entries are admitted in FIFO order as slots free up
//! - Duplicate enqueues are ignored without opening a second stream
//! - Removing a generating entry aborts its stream without surfacing an error
//! - Re-enqueueing a key resets its content before new text arrives
//! - Flushes batch chunk bursts instead of notifying per chunk
//! - Quota exhaustion surfaces the backend's detail message and allows retry

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;

use courseflow_core::{
    BackendError, EntryStatus, GenerationConfig, GenerationQueue, GenerationRequest, LessonKey,
    ScriptedBackend,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_queue(config: GenerationConfig) -> (GenerationQueue, Arc<ScriptedBackend>) {
    init_tracing();
    let backend = Arc::new(ScriptedBackend::new());
    let queue = GenerationQueue::new(config, backend.clone());
    (queue, backend)
}

fn fast_config() -> GenerationConfig {
    GenerationConfig::default().with_flush_interval(Duration::from_millis(2))
}

fn request(url: &str) -> GenerationRequest {
    GenerationRequest::new(url)
}

/// Poll `cond` with short sleeps so timers keep firing; panics after 5s
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Concurrency ceiling
// ============================================================================

#[tokio::test]
async fn ceiling_caps_accepted_entries() {
    let (queue, backend) = test_queue(fast_config().with_max_active(3).with_max_streaming(3));

    let keys: Vec<LessonKey> = (0..5).map(|i| LessonKey::from(format!("lesson/{i}"))).collect();
    let scripts: Vec<_> = (0..5)
        .map(|i| backend.script(&format!("/gen/{i}")))
        .collect();

    for (i, key) in keys.iter().enumerate().take(3) {
        assert!(queue.enqueue(key, format!("L{i}"), request(&format!("/gen/{i}"))));
    }
    for (i, key) in keys.iter().enumerate().skip(3) {
        assert!(
            !queue.enqueue(key, format!("L{i}"), request(&format!("/gen/{i}"))),
            "enqueue past the ceiling must be rejected"
        );
    }

    assert_eq!(queue.active_count(), 3);
    // Rejected keys never reached the backend
    assert_eq!(backend.open_count("/gen/3"), 0);
    assert_eq!(backend.open_count("/gen/4"), 0);

    for script in scripts.into_iter().take(3) {
        script.complete();
    }
    wait_until(|| queue.is_empty()).await;
}

#[tokio::test]
async fn streaming_ceiling_limits_open_streams() {
    let (queue, backend) = test_queue(fast_config().with_max_active(5).with_max_streaming(2));

    let scripts: Vec<_> = (0..4)
        .map(|i| backend.script(&format!("/gen/{i}")))
        .collect();
    let keys: Vec<LessonKey> = (0..4).map(|i| LessonKey::from(format!("lesson/{i}"))).collect();

    for (i, key) in keys.iter().enumerate() {
        assert!(queue.enqueue(key, format!("L{i}"), request(&format!("/gen/{i}"))));
    }

    wait_until(|| backend.open_count("/gen/1") == 1).await;
    assert_eq!(backend.open_count("/gen/2"), 0);
    assert_eq!(backend.open_count("/gen/3"), 0);
    assert_eq!(queue.status(&keys[2]), Some(EntryStatus::Queued));
    assert_eq!(queue.status(&keys[3]), Some(EntryStatus::Queued));

    for script in scripts {
        script.complete();
    }
    wait_until(|| queue.is_empty()).await;
}

// ============================================================================
// FIFO admission
// ============================================================================

#[tokio::test]
async fn freed_slots_backfill_in_enqueue_order() {
    let (queue, backend) = test_queue(fast_config().with_max_active(5).with_max_streaming(2));

    let keys: Vec<LessonKey> = (0..5).map(|i| LessonKey::from(format!("lesson/{i}"))).collect();
    let mut scripts: Vec<_> = (0..5)
        .map(|i| Some(backend.script(&format!("/gen/{i}"))))
        .collect();

    for (i, key) in keys.iter().enumerate() {
        assert!(queue.enqueue(key, format!("L{i}"), request(&format!("/gen/{i}"))));
    }
    wait_until(|| backend.open_count("/gen/1") == 1).await;

    // Finishing the first stream admits lesson 2, not 3 or 4
    scripts[0].take().unwrap().complete();
    wait_until(|| backend.open_count("/gen/2") == 1).await;
    assert_eq!(backend.open_count("/gen/3"), 0);
    assert_eq!(queue.status(&keys[3]), Some(EntryStatus::Queued));

    scripts[1].take().unwrap().complete();
    wait_until(|| backend.open_count("/gen/3") == 1).await;
    assert_eq!(backend.open_count("/gen/4"), 0);

    for script in scripts.into_iter().flatten() {
        script.complete();
    }
    wait_until(|| queue.is_empty()).await;
}

// ============================================================================
// Idempotent duplicate enqueue
// ============================================================================

#[tokio::test]
async fn duplicate_enqueue_has_no_effect() {
    let (queue, backend) = test_queue(fast_config());
    let key = LessonKey::from("algebra/fractions");
    let script = backend.script("/gen/fractions");

    assert!(queue.enqueue(&key, "Fractions", request("/gen/fractions")));
    wait_until(|| backend.open_count("/gen/fractions") == 1).await;

    assert!(script.push("part one").await);
    wait_until(|| queue.store().content(&key) == "part one").await;

    // Duplicate while generating: rejected, no second stream, content intact
    assert!(!queue.enqueue(&key, "Fractions", request("/gen/fractions")));
    assert_eq!(backend.open_count("/gen/fractions"), 1);
    assert_eq!(queue.store().content(&key), "part one");
    assert_eq!(queue.visible_entries().len(), 1);

    script.complete();
    wait_until(|| queue.is_empty()).await;
}

// ============================================================================
// Cancellation is not an error
// ============================================================================

#[tokio::test]
async fn removal_aborts_without_error() {
    let (queue, backend) = test_queue(fast_config().with_max_streaming(1));
    let (a, b) = (LessonKey::from("a"), LessonKey::from("b"));
    let script_a = backend.script("/gen/a");
    let script_b = backend.script("/gen/b");

    assert!(queue.enqueue(&a, "A", request("/gen/a")));
    assert!(queue.enqueue(&b, "B", request("/gen/b")));
    wait_until(|| backend.open_count("/gen/a") == 1).await;
    assert!(script_a.push("partial").await);
    wait_until(|| queue.store().content(&a) == "partial").await;

    queue.remove(&a);
    assert!(queue.status(&a).is_none(), "removed entry must be gone");

    // The freed slot goes to the waiting entry
    wait_until(|| backend.open_count("/gen/b") == 1).await;

    // The aborted stream detaches; late pushes fail
    wait_until(|| !script_a.is_attached()).await;
    assert!(!script_a.push("late").await);

    script_b.complete();
    wait_until(|| queue.is_empty()).await;

    // The removal never resurfaced as an error entry
    assert!(queue.status(&a).is_none());
    assert!(queue.visible_entries().is_empty());
}

// ============================================================================
// Content reset on regenerate
// ============================================================================

#[tokio::test]
async fn reenqueue_resets_content_before_new_text() {
    let (queue, backend) = test_queue(fast_config());
    let key = LessonKey::from("algebra/fractions");

    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let log_writer = log.clone();
    let _sub = queue.store().subscribe(&key, move |content| {
        log_writer.lock().unwrap().push(content.to_string());
    });

    let first = backend.script("/gen/fractions");
    assert!(queue.enqueue(&key, "Fractions", request("/gen/fractions")));
    wait_until(|| backend.open_count("/gen/fractions") == 1).await;
    assert!(first.push("abc").await);
    first.complete();
    wait_until(|| queue.is_empty()).await;
    assert_eq!(queue.store().content(&key), "abc");

    let second = backend.script("/gen/fractions");
    assert!(queue.enqueue(&key, "Fractions", request("/gen/fractions")));
    wait_until(|| backend.open_count("/gen/fractions") == 2).await;
    assert!(second.push("xyz").await);
    second.complete();
    wait_until(|| queue.is_empty()).await;
    assert_eq!(queue.store().content(&key), "xyz");

    // The subscriber saw the reset: an empty notification between the
    // first stream's text and the second's
    let seen = log.lock().unwrap().clone();
    let after_abc = seen
        .iter()
        .position(|c| c == "abc")
        .expect("first stream content never observed");
    assert!(
        seen[after_abc..].iter().any(String::is_empty),
        "no reset notification between streams: {seen:?}"
    );
}

// ============================================================================
// Flush batching
// ============================================================================

#[tokio::test]
async fn flushes_batch_chunk_bursts() {
    let (queue, backend) = test_queue(fast_config().with_flush_interval(Duration::from_millis(50)));
    let key = LessonKey::from("burst");
    let script = backend.script("/gen/burst");

    let notifications = Arc::new(AtomicUsize::new(0));
    let counter = notifications.clone();
    let _sub = queue.store().subscribe(&key, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(queue.enqueue(&key, "Burst", request("/gen/burst")));
    wait_until(|| backend.open_count("/gen/burst") == 1).await;

    let mut expected = String::new();
    for i in 0..20 {
        let chunk = format!("chunk{i};");
        expected.push_str(&chunk);
        assert!(script.push(&chunk).await);
    }
    script.complete();
    wait_until(|| queue.is_empty()).await;

    assert_eq!(queue.store().content(&key), expected);
    // Subscribe fires once on registration and once for the reset at stream
    // start; the 20 chunks themselves must have coalesced into fewer flushes
    let count = notifications.load(Ordering::SeqCst);
    assert!(
        count < 22,
        "expected batched flushes, saw {count} notifications for 20 chunks"
    );
}

// ============================================================================
// Error surfacing and retry
// ============================================================================

#[tokio::test]
async fn quota_error_is_visible_and_retryable() {
    let (queue, backend) = test_queue(fast_config());
    let key = LessonKey::from("algebra/limits");
    backend.script_error(
        "/gen/limits",
        BackendError::from_status(402, r#"{"detail":"Not enough credits"}"#),
    );

    assert!(queue.enqueue(&key, "Limits", request("/gen/limits")));
    wait_until(|| queue.status(&key) == Some(EntryStatus::Error)).await;

    let entries = queue.visible_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].error.as_deref(), Some("Not enough credits"));
    assert_eq!(entries[0].status, EntryStatus::Error);

    // The failed entry does not hold a slot; a retry opens a fresh stream
    assert_eq!(queue.active_count(), 0);
    let retry = backend.script("/gen/limits");
    assert!(queue.enqueue(&key, "Limits", request("/gen/limits")));
    wait_until(|| backend.open_count("/gen/limits") == 2).await;
    assert!(retry.push("content").await);
    retry.complete();
    wait_until(|| queue.is_empty()).await;
    assert_eq!(queue.store().content(&key), "content");
}

#[tokio::test]
async fn midstream_failure_keeps_partial_content() {
    let (queue, backend) = test_queue(fast_config());
    let key = LessonKey::from("partial");
    let script = backend.script("/gen/partial");

    assert!(queue.enqueue(&key, "Partial", request("/gen/partial")));
    wait_until(|| backend.open_count("/gen/partial") == 1).await;

    assert!(script.push("kept text").await);
    assert!(script.fail("connection reset").await);

    wait_until(|| queue.status(&key) == Some(EntryStatus::Error)).await;
    assert_eq!(queue.store().content(&key), "kept text");
    assert_eq!(
        queue.visible_entries()[0].error.as_deref(),
        Some("connection reset")
    );
}

// ============================================================================
// Snapshot publication
// ============================================================================

#[tokio::test]
async fn snapshot_watchers_see_lifecycle() {
    let (queue, backend) = test_queue(fast_config());
    let mut snapshots = queue.subscribe();
    let key = LessonKey::from("watched");
    let script = backend.script("/gen/watched");

    assert!(queue.enqueue(&key, "Watched", request("/gen/watched")));
    let first = snapshots.borrow_and_update().clone();
    assert_eq!(first.entries.len(), 1);
    assert_eq!(first.entries[0].title, "Watched");

    wait_until(|| backend.open_count("/gen/watched") == 1).await;
    script.complete();
    wait_until(|| queue.is_empty()).await;
    assert!(snapshots.borrow_and_update().entries.is_empty());
}
