//! Server transport seam.
//!
//! The engine never owns an HTTP client; the embedding application hands it
//! an implementation of [`Transport`]. Pagination is newest-first: a page
//! request addressed by a [`BuildCursor`] returns records strictly older
//! than that position.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use crate::error::TransportError;
use crate::types::BuildCursor;

/// A record as the server holds it: metadata in the clear for ordering,
/// content sealed under the owner's key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    pub order: u64,
    pub time: i64,
    /// Key-owner context; resolved to a decryption key via `KeyProvider`.
    pub owner: String,
    /// Content ciphertext under the owner key.
    pub payload: Vec<u8>,
}

/// One batch of the server event stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    /// Cursor after this batch; feed back to get the next one.
    pub cursor: String,
    /// More batches are immediately available behind this one.
    pub more_available: bool,
    /// Account-wide change too large to patch incrementally; the whole
    /// index must be refreshed against current server state.
    pub refresh_required: bool,
    /// A key rotation happened; previously undecryptable records may now
    /// be readable and should be re-attempted.
    pub key_rotated: bool,
    pub mutations: Vec<EventMutation>,
}

/// A single index mutation carried by the event stream. IDs are stable
/// keys, so replaying a mutation converges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventMutation {
    Create(RemoteRecord),
    Update(RemoteRecord),
    Delete { id: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Total number of records on the server, for build progress.
    async fn fetch_record_count(&self) -> Result<u64, TransportError>;

    /// One page of records strictly older than `before` (or the newest
    /// page when `None`), newest-first, at most `limit` records.
    async fn fetch_records_page(
        &self,
        before: Option<&BuildCursor>,
        limit: usize,
    ) -> Result<Vec<RemoteRecord>, TransportError>;

    /// A single record by ID, or `None` if it no longer exists.
    async fn fetch_single_record(&self, id: &str) -> Result<Option<RemoteRecord>, TransportError>;

    /// The newest event cursor, used to anchor the stream before a build.
    async fn latest_cursor(&self) -> Result<String, TransportError>;

    /// Events accumulated since `cursor`.
    async fn fetch_events_since(&self, cursor: &str) -> Result<EventBatch, TransportError>;
}
