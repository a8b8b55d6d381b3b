use crate::crypto::CryptoError;

/// Failures of the durable store layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Index storage corrupt: {0}")]
    Corrupt(String),
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Failures reaching or talking to the server.
///
/// `retryable` distinguishes transient faults (network-level failures and
/// the 408/429/502/503 status family) that callers retry with backoff from
/// everything else, which is surfaced immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned status {0}")]
    Status(u16),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn retryable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status(code) => matches!(code, 408 | 429 | 502 | 503),
            TransportError::Protocol(_) => false,
        }
    }
}

/// Failures of the bulk indexing pipeline.
///
/// Cancellation is not represented here: an aborted build is a normal
/// terminal state and returns `Ok(BuildOutcome::Aborted)`.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Transient failure persisted beyond retry bound: {0}")]
    Transient(#[source] TransportError),

    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Key unavailable: {0}")]
    Key(#[from] CryptoError),

    #[error("A build or refresh is already running")]
    Busy,
}

/// Failures of event synchronization.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Transient failure persisted beyond retry bound: {0}")]
    Transient(#[source] TransportError),

    #[error("Event protocol violation: {0}")]
    Protocol(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Index storage corrupt: {0}")]
    Corrupt(String),
}

/// Failures of engine lifecycle operations (open, wipe, enable/disable).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Key unavailable: {0}")]
    Key(#[from] CryptoError),
}

/// Failures of query execution.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Search superseded by a newer one")]
    Superseded,

    #[error("Encrypted search is disabled")]
    Disabled,
}
