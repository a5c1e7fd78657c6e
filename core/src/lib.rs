//! Courseflow Core - Streaming Lesson Generation for courseflow
//!
//! This crate provides the client-side generation pipeline for courseflow,
//! completely independent of any UI framework. It can drive a TUI, a web
//! frontend through bindings, or run headless for testing and automation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      UI Surfaces                             │
//! │   lesson view (renders content)   queue bar (renders queue)  │
//! └───────────┬───────────────────────────────┬──────────────────┘
//!             │ Subscription callbacks        │ watch snapshots
//! ┌───────────┴───────────────────────────────┴──────────────────┐
//! │                     COURSEFLOW CORE                          │
//! │  ┌──────────────┐   ┌─────────────────────────────────────┐  │
//! │  │ ContentStore │◄──│          GenerationQueue            │  │
//! │  │  (per-key    │   │  admission ceiling + FIFO backfill  │  │
//! │  │   content)   │   │  ┌───────────────────────────────┐  │  │
//! │  └──────────────┘   │  │         StreamRunner          │  │  │
//! │                     │  │  buffer + periodic flush      │  │  │
//! │                     │  └──────────────┬────────────────┘  │  │
//! │                     └─────────────────┼───────────────────┘  │
//! │                         ┌─────────────┴──────────────┐       │
//! │                         │       ContentBackend       │       │
//! │                         │  (HTTP streaming, mocks)   │       │
//! │                         └────────────────────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`GenerationQueue`]: Bounded-concurrency admission over lesson streams
//! - [`ContentStore`]: Per-lesson accumulated text with change subscriptions
//! - [`StreamRunner`]: Drives one stream from backend chunks into the store
//! - [`ContentBackend`]: Seam over the streaming transport (HTTP or scripted)
//! - [`GenerationConfig`]: Ceilings and flush cadence, overridable from env
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use courseflow_core::{
//!     GenerationConfig, GenerationQueue, GenerationRequest, LessonKey,
//!     backend::HttpContentBackend,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = Arc::new(HttpContentBackend::new());
//!     let queue = GenerationQueue::new(GenerationConfig::from_env(), backend);
//!
//!     let key = LessonKey::from("algebra/quadratics");
//!     let _sub = queue.store().subscribe(&key, |content| {
//!         // re-render the lesson view with `content`
//!     });
//!
//!     let request = GenerationRequest::new("https://api.example.com/generate")
//!         .with_field("lesson", serde_json::json!("quadratics"));
//!     queue.enqueue(&key, "Quadratic equations", request);
//!
//!     // watch queue snapshots for the progress bar
//!     let mut snapshots = queue.subscribe();
//!     while snapshots.changed().await.is_ok() {
//!         let snapshot = snapshots.borrow().clone();
//!         // re-render the queue bar from `snapshot.entries`
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`store`]: Per-lesson content accumulation and change subscriptions
//! - [`backend`]: Streaming transport seam (HTTP implementation, test mock)
//! - [`runner`]: Single-stream lifecycle (open, buffer, flush, terminate)
//! - [`queue`]: Admission control, FIFO backfill, queue snapshots
//! - [`config`]: Tuning knobs with environment overrides
//!
//! # No UI Dependencies
//!
//! This crate has **zero** dependencies on any rendering framework. It is
//! pure pipeline logic that any surface can sit on top of.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod queue;
pub mod runner;
pub mod store;

pub use backend::{
    BackendError, ContentBackend, GenerationRequest, HttpContentBackend, ScriptedBackend,
    StreamChunk, StreamScript,
};
pub use config::GenerationConfig;
pub use queue::{EntryStatus, GenerationQueue, QueueEntry, QueueSnapshot};
pub use runner::{RunnerEvents, StreamOutcome, StreamRunner};
pub use store::{ContentCallback, ContentStore, LessonKey, Subscription};
