//! Error types for kvitto.

use thiserror::Error;
use uuid::Uuid;

use crate::models::DocState;

/// Result type alias using kvitto's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for kvitto operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A relative path resolved outside the storage root. Security boundary,
    /// never tolerated.
    #[error("Path escapes storage root: {0}")]
    PathEscape(String),

    /// A document with the same content hash (or provider attachment id)
    /// already exists. Expected steady-state outcome for intake adapters.
    #[error("Duplicate content: {0}")]
    DuplicateContent(String),

    /// A state transition found the document in an unexpected state,
    /// signalling a concurrent double-processing attempt.
    #[error("Invalid transition for document {id}: expected {expected}, wanted {to}")]
    InvalidTransition {
        id: Uuid,
        expected: DocState,
        to: DocState,
    },

    /// Document not found
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Mailbox provider call failed
    #[error("Mailbox error: {0}")]
    Mailbox(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Job coordination error (lock primitive, run bookkeeping, log sink)
    #[error("Job error: {0}")]
    Job(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether this error is an expected steady-state occurrence that intake
    /// adapters convert into a counter rather than propagating.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateContent(_))
    }
}
