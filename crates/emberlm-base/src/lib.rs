//! The base for `emberlm`: everything between the math kernels and the
//! engine façade.
//!
//! - [`model`]: the immutable [`ModelBundle`] of hyperparameters and
//!   weights, shared read-only across sessions.
//! - [`loader`]: the boundary a concrete model-file parser implements,
//!   plus content-hash fingerprints for import caching.
//! - [`tokenizer`]: the tokenizer interface, a byte-level implementation,
//!   and UTF-8 boundary buffering for streamed decode.
//! - [`kv`]: the budgeted, LRU-evicting store of per-session key/value
//!   cache entries.
//! - [`sampler`]: the logit pipeline and seeded multinomial draw.
//! - [`transformer`]: the decoder forward pass.
//! - [`session`]: the per-request runtime; prefill, decode, stop
//!   sequences, streaming, cancellation, snapshots.
//!
//! Not intended for direct use; depend on the `emberlm` crate instead.

pub mod error;
pub mod kv;
pub mod loader;
pub mod model;
pub mod sampler;
pub mod session;
pub mod telemetry;
pub mod tokenizer;
pub mod transformer;

pub use error::{ErrorKind, FinishReason, InferenceError};
pub use kv::{KvBudget, KvEntry, KvStore, SessionId};
pub use loader::{check_tokenizer, LoadContext, LoadError, LoadedModel, ModelFingerprint, ModelLoader};
pub use model::{Hyperparameters, LayerWeights, ModelBundle, TokenId, Weight};
pub use sampler::{SamplerParams, SamplerState};
pub use session::{
    CancellationToken, ChatMessage, ContextPolicy, GenerationRequest, GenerationResult, Prompt,
    Role, Session, SessionConfig, SessionSnapshot, SessionState, StopMatcher, Timings, TokenEvent,
    TokenStream, Usage,
};
pub use telemetry::{LogSink, TelemetryEvent, TelemetrySink};
pub use tokenizer::{ByteTokenizer, TokenBuffer, Tokenizer, TokenizerError};
pub use transformer::{evaluate, OutputRequest};

#[cfg(test)]
pub(crate) mod test_support;
