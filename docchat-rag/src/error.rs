//! Error types for the `docchat-rag` crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in RAG operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// A configuration parameter was rejected before any work was done.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The document contained no indexable text.
    #[error("Document '{document_id}' is empty")]
    EmptyDocument {
        /// The ID of the rejected document.
        document_id: String,
    },

    /// Embedding vectors of different lengths were mixed in one index.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The dimensionality already established by the index.
        expected: usize,
        /// The offending vector's dimensionality.
        actual: usize,
    },

    /// An error occurred during embedding generation.
    #[error("Embedding error ({provider}): {message}")]
    EmbeddingFailure {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// An error occurred during answer generation.
    #[error("Generation error ({provider}): {message}")]
    GenerationFailure {
        /// The generation backend that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// The model-serving backend could not be reached.
    #[error("Backend unavailable ({backend}): {message}")]
    BackendUnavailable {
        /// The backend that could not be reached.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// A backend call exceeded the configured request timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// A query was submitted before a document finished ingesting.
    #[error("Session is not ready (state: {state})")]
    NotReady {
        /// The session state at the time of the call.
        state: String,
    },

    /// The operation was cancelled by its caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// A snapshot on disk could not be read or was inconsistent.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// Whether the failed call may succeed if issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::BackendUnavailable { .. } | RagError::Timeout { .. })
    }
}

/// A convenience result type for RAG operations.
pub type Result<T> = std::result::Result<T, RagError>;
