//! Error types for the chat core
//!
//! Defines application-level errors and collaborator (store) errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers fatal transport errors (connection termination) and business
/// errors that are surfaced to the caller layer as request failures.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Entity absent: queue entry, conversation, message, user
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate saved conversation, double like, lost pairing race
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Not a participant, not the author, bad token
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed identifiers or request fields
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Failure of a non-critical side effect; logged, never rolls back
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Matchmaking found nobody eligible; the requester stays queued
    #[error("No candidate available")]
    NoCandidateAvailable,

    /// Hard failure of the backing store
    #[error("Store error: {0}")]
    Store(String),
}

impl AppError {
    /// Whether the connection or request should be torn down rather than answered
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::WebSocket(_) | AppError::Io(_) | AppError::ChannelSend
        )
    }
}

/// Errors reported by store collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Conflict(what) => AppError::Conflict(what),
            StoreError::Backend(msg) => AppError::Store(msg),
        }
    }
}

/// Message send errors
///
/// Occurs when a frame cannot be queued on a connection's outbound channel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The outbound buffer is saturated (slow consumer)
    #[error("Outbound buffer full")]
    BufferFull,

    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_maps_to_taxonomy() {
        let not_found: AppError = StoreError::NotFound("conversation".into()).into();
        assert!(matches!(not_found, AppError::NotFound(_)));

        let conflict: AppError = StoreError::Conflict("participant".into()).into();
        assert!(matches!(conflict, AppError::Conflict(_)));

        let backend: AppError = StoreError::Backend("disk on fire".into()).into();
        assert!(matches!(backend, AppError::Store(_)));
    }

    #[test]
    fn test_no_candidate_distinct_from_store_failure() {
        assert_ne!(
            AppError::NoCandidateAvailable.to_string(),
            AppError::Store("timeout".into()).to_string()
        );
        assert!(!AppError::NoCandidateAvailable.is_fatal());
        assert!(AppError::ChannelSend.is_fatal());
    }
}
