//! Content-Generation Backend Abstraction
//!
//! The only external interface of this crate is the HTTP boundary to the
//! content-generation endpoint: a streaming POST whose response body is
//! unframed UTF-8 text. The [`ContentBackend`] trait keeps the stream runner
//! independent of that transport; [`HttpContentBackend`] is the production
//! implementation and [`ScriptedBackend`] the test double.

mod http;
mod mock;
mod traits;

pub use http::HttpContentBackend;
pub use mock::{ScriptedBackend, StreamScript};
pub use traits::{BackendError, ContentBackend, GenerationRequest, StreamChunk};
