//! HTTP Content Backend
//!
//! Production backend for the content-generation endpoint: a streaming POST
//! whose response body is unframed UTF-8 text. Bytes are decoded
//! incrementally (a multi-byte code point may split across HTTP chunks) and
//! forwarded through the channel; stream-end is message-end.
//!
//! Cancellation is purely client-side: the runner drops the receiver, the
//! forwarding task's next send fails, and dropping the response aborts the
//! connection. No cancel message is sent to the server.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::traits::{BackendError, ContentBackend, GenerationRequest, StreamChunk};

/// Channel capacity between the forwarding task and the runner
const CHUNK_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// HTTP Backend
// ============================================================================

/// Content backend over a streaming HTTP POST
///
/// No request timeout is applied: generation streams are long-lived and the
/// queue layer deliberately has no stuck-stream recovery.
#[derive(Clone)]
pub struct HttpContentBackend {
    client: reqwest::Client,
}

impl HttpContentBackend {
    /// Create a backend with a default client
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    /// Create a backend over an existing client (shared pools, custom TLS)
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpContentBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentBackend for HttpContentBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn open_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, BackendError> {
        let response = self
            .client
            .post(&request.url)
            .json(&request.body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), &body));
        }

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let mut stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut decoder = Utf8Carry::default();

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        let text = decoder.push(&bytes);
                        if !text.is_empty() && tx.send(StreamChunk::Text(text)).await.is_err() {
                            // Receiver dropped: stream was cancelled
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                        return;
                    }
                }
            }

            let rest = decoder.finish();
            if !rest.is_empty() {
                let _ = tx.send(StreamChunk::Text(rest)).await;
            }
            // Dropping tx closes the channel: normal end-of-stream
        });

        Ok(rx)
    }
}

// ============================================================================
// Incremental UTF-8 decoding
// ============================================================================

/// Decodes UTF-8 across chunk boundaries, carrying incomplete trailing
/// sequences into the next push.
#[derive(Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Decode as much of the accumulated bytes as possible
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let buf = std::mem::take(&mut self.pending);

        match String::from_utf8(buf) {
            Ok(text) => text,
            Err(err) => {
                let utf8_err = err.utf8_error();
                let buf = err.into_bytes();
                if utf8_err.error_len().is_some() {
                    // Genuinely invalid bytes, not a chunk boundary
                    String::from_utf8_lossy(&buf).into_owned()
                } else {
                    let valid = utf8_err.valid_up_to();
                    self.pending = buf[valid..].to_vec();
                    String::from_utf8_lossy(&buf[..valid]).into_owned()
                }
            }
        }
    }

    /// Flush whatever remains at end-of-stream
    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            String::new()
        } else {
            String::from_utf8_lossy(&rest).into_owned()
        }
    }
}
