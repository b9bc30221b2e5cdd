use thiserror::Error;

/// Error taxonomy for the sync pipeline.
///
/// Background continuations never let these escape as panics; the worst
/// outcome of a failed submission is a row stuck in FAILED awaiting an
/// explicit retry.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("message content must not be empty")]
    Validation,

    #[error("backend rejected the credentials")]
    Auth,

    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("backend rejected the message: {0}")]
    Rejected(String),

    #[error("malformed inbound frame: {0}")]
    MalformedMessage(String),

    #[error("unknown message id or wrong state: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("transport channel failure: {0}")]
    Channel(String),
}

impl SyncError {
    /// True when a later retry of the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedMessage(err.to_string())
    }
}
