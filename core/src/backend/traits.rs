//! Content Backend Traits
//!
//! Trait definitions for the content-generation endpoint. The abstraction
//! lets the stream runner work against any transport (production HTTP,
//! scripted test streams) without changing core logic.
//!
//! # Design Philosophy
//!
//! A backend's only job is to open one streaming read and feed decoded text
//! through a channel. Everything above it (buffering, flushing, admission,
//! cancellation policy) lives in the runner and the queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// Request Descriptor
// ============================================================================

/// Parameters needed to (re)start one generation stream
///
/// Stored by the queue so it can self-start parked work without depending on
/// the caller that enqueued it still being alive.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Endpoint URL for the streaming POST
    pub url: String,
    /// JSON request payload (opaque to this crate)
    pub body: serde_json::Value,
}

impl GenerationRequest {
    /// Create a request with an empty JSON object body
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: serde_json::json!({}),
        }
    }

    /// Replace the request body
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    /// Set one field on the JSON body (no-op if the body is not an object)
    #[must_use]
    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let Some(object) = self.body.as_object_mut() {
            object.insert(key.to_string(), value.into());
        }
        self
    }
}

// ============================================================================
// Stream Chunks
// ============================================================================

/// Events delivered over a content stream channel
///
/// Channel close without an `Error` is normal end-of-stream; there is no
/// explicit completion marker on the wire.
#[derive(Clone, Debug)]
pub enum StreamChunk {
    /// Decoded UTF-8 text from the response body
    Text(String),
    /// Transport failure mid-read; terminates the stream
    Error(String),
}

// ============================================================================
// Backend Errors
// ============================================================================

/// Failure opening a content stream
///
/// The `Display` output is the user-facing message the queue records on the
/// entry, so variants carry fully-formed text.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Quota/payment required (HTTP 402); server message shown verbatim
    #[error("{detail}")]
    QuotaExceeded {
        /// The `detail` field from the error body, meant for the end user
        detail: String,
    },
    /// Any other non-2xx response
    #[error("{message}")]
    RequestFailed {
        /// HTTP status code
        status: u16,
        /// Body `detail` if present, otherwise a generic status message
        message: String,
    },
    /// Connection or protocol failure before a response arrived
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
}

impl BackendError {
    /// Map a non-2xx status and its raw body to the right error variant
    ///
    /// A JSON body with a `detail` field supplies the message; 402 passes it
    /// through verbatim since it is meant for the end user directly.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|value| {
                value
                    .get("detail")
                    .and_then(|detail| detail.as_str())
                    .map(String::from)
            });

        if status == 402 {
            return Self::QuotaExceeded {
                detail: detail.unwrap_or_else(|| "Payment required".to_string()),
            };
        }

        Self::RequestFailed {
            status,
            message: detail.unwrap_or_else(|| format!("Request failed with status: {status}")),
        }
    }
}

// ============================================================================
// Content Backend trait
// ============================================================================

/// Content-generation backend
///
/// Implementations open one long-lived streaming read per call and feed
/// decoded text through the returned channel. Dropping the receiver must
/// stop the underlying read.
#[async_trait]
pub trait ContentBackend: Send + Sync {
    /// Backend name for logs (e.g., "http")
    fn name(&self) -> &str;

    /// Open a streaming read for the given request
    ///
    /// A non-2xx response or connection failure is returned as an error;
    /// failures after the stream is open arrive as [`StreamChunk::Error`].
    async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, BackendError>;
}
