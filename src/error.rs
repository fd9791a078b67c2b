use thiserror::Error;

/// Errors surfaced by the external session storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    SessionNotFound(i64),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WbotError {
    #[error("session {0} is not initialized")]
    NotInitialized(i64),
    #[error("session {0} already has a live connection")]
    AlreadyConnected(i64),
    #[error("session {0}: connection closed before becoming ready: {1}")]
    ClosedBeforeOpen(i64, String),
    #[error("session {0}: credential blob is malformed: {1}")]
    MalformedBlob(i64, serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
