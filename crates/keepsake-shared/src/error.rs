use thiserror::Error;

/// Failure taxonomy surfaced by every core operation.
///
/// Only [`AppError::Transient`] is safe to retry blindly; everything else
/// means the request itself is wrong and must be corrected first.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed input (empty message, past delivery time, self-request, ...).
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The actor lacks rights over the target entity.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Operation invalid for the entity's current lifecycle state.
    #[error("invalid state: {0}")]
    State(String),

    /// Duplicate request / already connected / record already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Referenced entity absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Store or network failure; the caller may retry.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl AppError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        Self::Permission(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Whether a blind retry by the caller is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
