//! The error taxonomy shared by the inference runtime.

use thiserror::Error;

/// Errors surfaced while serving a generation request.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// The request options failed validation; nothing was mutated.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    /// The prompt plus requested output cannot fit the context window.
    #[error("context window overflow: {needed} tokens needed, {available} available")]
    ContextOverflow { needed: usize, available: usize },
    /// The KV store refused admission under its byte or session budgets.
    #[error("KV cache budget exceeded: {0}")]
    BudgetExceeded(String),
    /// The request was cancelled by the host.
    #[error("request cancelled")]
    RequestCancelled,
    /// The request deadline expired.
    #[error("request deadline expired")]
    Timeout,
    /// The prompt could not be tokenized.
    #[error("tokenization failed: {0}")]
    TokenizationFailed(String),
    /// A kernel or numeric failure; the session must be discarded.
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    /// Embedding extraction failed.
    #[error("embedding extraction failed: {0}")]
    EmbeddingFailed(String),
    /// An invariant the runtime relies on was broken.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl InferenceError {
    /// Coarse kind tag carried by terminal stream events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::InvalidOptions(_) => ErrorKind::InvalidOptions,
            InferenceError::ContextOverflow { .. } => ErrorKind::ContextOverflow,
            InferenceError::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
            InferenceError::RequestCancelled => ErrorKind::RequestCancelled,
            InferenceError::Timeout => ErrorKind::Timeout,
            InferenceError::TokenizationFailed(_) => ErrorKind::TokenizerMismatch,
            InferenceError::InferenceFailed(_) => ErrorKind::InferenceFailed,
            InferenceError::EmbeddingFailed(_) => ErrorKind::EmbeddingFailed,
            InferenceError::InternalError(_) => ErrorKind::InternalError,
        }
    }
}

/// Wire-stable error kinds for terminal [`crate::session::TokenEvent::Error`]
/// events and host-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    InvalidOptions,
    ModelLoadFailed,
    UnsupportedModelFormat,
    TokenizerMismatch,
    ContextOverflow,
    BudgetExceeded,
    RequestCancelled,
    Timeout,
    InferenceFailed,
    EmbeddingFailed,
    InternalError,
}

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FinishReason {
    /// The model emitted its end-of-sequence token.
    Completed,
    /// A configured stop sequence was produced.
    StopSequence,
    /// The `max_new_tokens` budget was reached.
    Length,
    /// The host cancelled the request.
    Cancelled,
    /// The request deadline expired.
    Timeout,
    /// The request failed; see the accompanying error event.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_stably() {
        assert_eq!(
            InferenceError::ContextOverflow { needed: 10, available: 4 }.kind(),
            ErrorKind::ContextOverflow
        );
        assert_eq!(InferenceError::RequestCancelled.kind(), ErrorKind::RequestCancelled);
        assert_eq!(InferenceError::Timeout.kind(), ErrorKind::Timeout);
    }
}
