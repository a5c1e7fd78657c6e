//! Queue configuration
//!
//! Plain-struct configuration with builder-style setters and an environment
//! override layer. Defaults are deliberately conservative: three concurrent
//! generations saturates a typical backend without starving interactive
//! requests.

use std::time::Duration;

/// Default admission ceiling (queued plus generating)
pub const DEFAULT_MAX_ACTIVE: usize = 3;

/// Default number of simultaneously open streams
pub const DEFAULT_MAX_STREAMING: usize = 3;

/// Default interval between buffered-content flushes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Tuning knobs for a [`GenerationQueue`](crate::queue::GenerationQueue)
#[derive(Clone, Debug)]
pub struct GenerationConfig {
    /// Ceiling on entries held by the queue at once; enqueue requests past
    /// it are rejected rather than parked
    pub max_active: usize,
    /// Ceiling on streams reading from the backend at once; entries past it
    /// wait in FIFO order
    pub max_streaming: usize,
    /// How often buffered stream text is flushed into the content store
    pub flush_interval: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_active: DEFAULT_MAX_ACTIVE,
            max_streaming: DEFAULT_MAX_STREAMING,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

impl GenerationConfig {
    /// Defaults overridden by `COURSEFLOW_*` environment variables
    ///
    /// Recognized: `COURSEFLOW_MAX_ACTIVE`, `COURSEFLOW_MAX_STREAMING`,
    /// `COURSEFLOW_FLUSH_INTERVAL_MS`. Unset or unparseable values fall
    /// back to the default for that knob.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_parse::<usize>("COURSEFLOW_MAX_ACTIVE") {
            config.max_active = value;
        }
        if let Some(value) = env_parse::<usize>("COURSEFLOW_MAX_STREAMING") {
            config.max_streaming = value;
        }
        if let Some(millis) = env_parse::<u64>("COURSEFLOW_FLUSH_INTERVAL_MS") {
            config.flush_interval = Duration::from_millis(millis);
        }
        config
    }

    /// Set the admission ceiling
    #[must_use]
    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    /// Set the concurrent-stream ceiling
    #[must_use]
    pub fn with_max_streaming(mut self, max_streaming: usize) -> Self {
        self.max_streaming = max_streaming;
        self
    }

    /// Set the flush interval
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
