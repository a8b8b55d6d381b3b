//! Client-side encrypted search engine for message archives.
//!
//! Builds, maintains and queries a locally persisted, AES-GCM-sealed
//! index of a user's messages without ever exposing plaintext to the
//! server.
//!
//! ## Module Organization
//!
//! - `engine`: per-account facade tying everything together
//! - `builder`: resumable, cancellable bulk-indexing pipeline
//! - `sync`: event-driven incremental synchronization
//! - `store/`: durable, encrypted SQLite persistence
//! - `cache`: bounded in-memory working set of decrypted records
//! - `search/`: hybrid cache/disk query execution and highlighting
//! - `crypto`: sealing primitives and the external key seam
//! - `transport`: server transport seam
//!
//! The embedding application supplies [`Transport`], [`KeyProvider`] and
//! optionally a [`MetricsSink`]; the engine owns everything else:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use encrypted_search::*;
//! # async fn example(
//! #     transport: Arc<dyn Transport>,
//! #     keys: Arc<dyn KeyProvider>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = EncryptedSearchEngine::open(
//!     EngineConfig::default(),
//!     transport,
//!     keys,
//!     Arc::new(NoopMetrics),
//! )
//! .await?;
//!
//! engine.start_build().await?;
//! let output = engine.search(SearchParams::new(["invoice"]), None).await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod cache;
mod cancel;
mod config;
mod crypto;
mod engine;
mod error;
mod metrics;
mod search;
mod store;
mod sync;
#[cfg(test)]
pub(crate) mod testing;
mod transport;
mod types;

pub use builder::{BuildOutcome, IndexBuilder, ProgressCallback};
pub use cache::{Cache, CacheEntry, CacheSnapshot};
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use crypto::{derive_key_from_secret, CryptoError, IndexCipher, IndexKey, KeyProvider};
pub use engine::{EncryptedSearchEngine, EngineStatus};
pub use error::{BuildError, EngineError, SearchError, StoreError, SyncError, TransportError};
pub use metrics::{MetricsEvent, MetricsSink, NoopMetrics};
pub use search::highlight::{find_occurrences, mark_text, sanitize_positions, Range, TextSegment};
pub use search::SearchOutput;
pub use store::{SealedRecord, Store, StoreMutation};
pub use sync::{EventSynchronizer, SyncOutcome};
pub use transport::{EventBatch, EventMutation, RemoteRecord, Transport};
pub use types::{
    BuildCursor, BuildProgress, Record, RecordContent, SearchCursor, SearchParams, SortDir,
};
