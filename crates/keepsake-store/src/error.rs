use keepsake_shared::AppError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure for a stored document.
    #[error("Document serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A precondition expected the document to exist.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// A precondition expected the document to be absent, or a field
    /// transition observed an unexpected current value.
    #[error("Document conflict: {0}")]
    Conflict(String),

    /// Malformed document path.
    #[error("Invalid document path: {0}")]
    InvalidPath(String),

    /// Document payloads must be JSON objects.
    #[error("Invalid document payload: {0}")]
    InvalidDocument(String),

    /// Timestamp parse error on a stored column.
    #[error("Timestamp parse error: {0}")]
    ChronoParse(#[from] chrono::ParseError),

    /// Malformed query (bad field name, `In` filter over the arity limit).
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The store task has shut down; the operation may be retried once a
    /// fresh store handle is available.
    #[error("Store channel closed")]
    Closed,
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(path) => AppError::NotFound(path),
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            StoreError::InvalidPath(msg) => AppError::validation("path", msg),
            StoreError::InvalidQuery(msg) => AppError::validation("query", msg),
            StoreError::InvalidDocument(msg) => AppError::validation("document", msg),
            other => AppError::Transient(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
