//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by handler callbacks.
///
/// Callbacks belong to application code, so any error type is accepted; the
/// queue only needs to know that processing failed.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a single handler callback invocation.
pub type HandlerResult = std::result::Result<(), BoxError>;

/// Main error enum for the dispatch engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration or arguments.
    #[error("validation error: {0}")]
    Validation(String),

    /// An object a key could not be derived from.
    #[error("malformed object: {0}")]
    MalformedObject(String),

    /// Invalid event loop state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Informer caches never reported synced.
    #[error("cache sync failed for event loop {event_loop}: {reason}")]
    CacheSync { event_loop: String, reason: String },

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for the startup failure class surfaced by `EventLoop::run`.
    pub fn is_sync_failure(&self) -> bool {
        matches!(self, Error::CacheSync { .. })
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn malformed_object(msg: impl Into<String>) -> Self {
        Self::MalformedObject(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn cache_sync(event_loop: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CacheSync {
            event_loop: event_loop.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_sync_message_names_loop() {
        let err = Error::cache_sync("logger_queue", "timed out after 1s");
        assert!(err.is_sync_failure());
        assert_eq!(
            err.to_string(),
            "cache sync failed for event loop logger_queue: timed out after 1s"
        );
    }

    #[test]
    fn test_other_errors_are_not_sync_failures() {
        assert!(!Error::validation("workers").is_sync_failure());
        assert!(!Error::malformed_object("no metadata").is_sync_failure());
    }

    #[test]
    fn test_serde_json_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: Error = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("serialization error"));
    }
}
