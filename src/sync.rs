//! Incremental event synchronization.
//!
//! Keeps the store consistent with the server after the initial build.
//! A catch-up fetches the complete chain of pending event batches before
//! applying anything, applies mutations strictly in stream order, and
//! advances the durable cursor only once the whole chain is applied. A
//! failure anywhere leaves the cursor untouched; the retry re-applies the
//! same mutations, which converges because record IDs are stable keys.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::builder::decrypt_remote;
use crate::cache::Cache;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::crypto::{IndexCipher, KeyProvider};
use crate::error::SyncError;
use crate::store::{SealedRecord, Store, StoreMutation};
use crate::transport::{EventBatch, EventMutation, RemoteRecord, Transport, TransportError};
use crate::types::{Record, RecordContent};

/// Terminal states of one catch-up attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The chain was applied and the cursor advanced.
    Applied { cursor: String, applied: usize },
    /// A batch carried the account-wide refresh marker. Nothing was
    /// applied; the caller must run a full refresh, then set the cursor
    /// past the refresh point.
    RefreshRequired { cursor: String },
    Aborted,
}

pub struct EventSynchronizer {
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyProvider>,
    store: Arc<Store>,
    cipher: Arc<IndexCipher>,
    cache: Arc<Cache>,
    config: EngineConfig,
}

impl EventSynchronizer {
    pub fn new(
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyProvider>,
        store: Arc<Store>,
        cipher: Arc<IndexCipher>,
        cache: Arc<Cache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            transport,
            keys,
            store,
            cipher,
            cache,
            config,
        }
    }

    /// Catch up with every event accumulated since the stored cursor.
    pub async fn catch_up(&self, cancel: &CancelToken) -> Result<SyncOutcome, SyncError> {
        let from = self
            .store
            .event_cursor()?
            .ok_or_else(|| SyncError::Corrupt("event cursor missing".into()))?;

        let batches = match self.collect_chain(cancel, &from).await? {
            Some(batches) => batches,
            None => return Ok(SyncOutcome::Aborted),
        };
        if batches.is_empty() {
            debug!("Catch-up from {} found no new events", from);
            return Ok(SyncOutcome::Applied {
                cursor: from,
                applied: 0,
            });
        }

        let final_cursor = batches
            .last()
            .map(|batch| batch.cursor.clone())
            .unwrap_or(from);

        if batches.iter().any(|batch| batch.refresh_required) {
            info!("Event chain requires a full refresh, dropping incremental mutations");
            return Ok(SyncOutcome::RefreshRequired {
                cursor: final_cursor,
            });
        }

        // A key rotation may have made previously undecryptable records
        // readable; repair them before ingesting the new mutations.
        if batches.iter().any(|batch| batch.key_rotated) {
            self.repair_decrypt_failures(cancel).await?;
        }

        let total: usize = batches.iter().map(|batch| batch.mutations.len()).sum();
        for batch in &batches {
            if cancel.is_cancelled() {
                // Cursor untouched; the next catch-up replays the chain
                return Ok(SyncOutcome::Aborted);
            }
            self.apply_batch(batch).await?;
        }

        self.store.set_event_cursor(&final_cursor)?;
        info!(
            "Applied {} mutations over {} batches, cursor now {}",
            total,
            batches.len(),
            final_cursor
        );

        Ok(SyncOutcome::Applied {
            cursor: final_cursor,
            applied: total,
        })
    }

    /// Fetch batches until the server reports no more, so the whole unit
    /// of work is known before anything commits. `None` means cancelled.
    async fn collect_chain(
        &self,
        cancel: &CancelToken,
        from: &str,
    ) -> Result<Option<Vec<EventBatch>>, SyncError> {
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(from.to_string());

        let mut cursor = from.to_string();
        let mut batches = Vec::new();
        loop {
            let batch = match self.fetch_events(cancel, &cursor).await? {
                Some(batch) => batch,
                None => return Ok(None),
            };
            if batch.cursor.is_empty() {
                return Err(SyncError::Protocol("event batch without a cursor".into()));
            }

            let advanced = batch.cursor != cursor;
            if advanced && !seen.insert(batch.cursor.clone()) {
                return Err(SyncError::Protocol(format!(
                    "cursor regression to {}",
                    batch.cursor
                )));
            }
            if !advanced && batch.more_available {
                return Err(SyncError::Protocol(
                    "more data reported without cursor progress".into(),
                ));
            }

            let has_payload =
                !batch.mutations.is_empty() || batch.refresh_required || batch.key_rotated;
            if !advanced && !has_payload {
                // Fully caught up
                break;
            }

            cursor = batch.cursor.clone();
            let more = batch.more_available;
            batches.push(batch);
            if !more {
                break;
            }
        }

        Ok(Some(batches))
    }

    /// Apply one batch in stream order within a single store transaction,
    /// then mirror the changes into the cache.
    async fn apply_batch(&self, batch: &EventBatch) -> Result<(), SyncError> {
        let mut mutations = Vec::with_capacity(batch.mutations.len());
        let mut cache_upserts = Vec::new();
        let mut cache_deletes = Vec::new();

        for mutation in &batch.mutations {
            match mutation {
                EventMutation::Create(remote) | EventMutation::Update(remote) => {
                    let (content, decrypt_failed) =
                        match decrypt_remote(&*self.keys, remote).await {
                            Ok(content) => (content, false),
                            Err(e) => {
                                warn!("Undecryptable record {} in event stream: {}", remote.id, e);
                                (RecordContent::default(), true)
                            }
                        };
                    mutations.push(StoreMutation::Upsert(self.seal(remote, &content, decrypt_failed)?));
                    cache_upserts.push(Record {
                        id: remote.id.clone(),
                        order: remote.order,
                        time: remote.time,
                        content,
                    });
                }
                EventMutation::Delete { id } => {
                    mutations.push(StoreMutation::Delete(id.clone()));
                    cache_deletes.push(id.clone());
                }
            }
        }

        self.store.apply_mutations(&mutations)?;

        // Cache follows the store, never the other way around
        for record in cache_upserts {
            self.cache.apply_upsert(record);
        }
        for id in &cache_deletes {
            self.cache.apply_delete(id);
        }

        Ok(())
    }

    /// Re-attempt decryption for every flagged record, refetching each
    /// from the server. Records that are gone are dropped; records that
    /// still fail stay flagged for the next rotation.
    pub async fn repair_decrypt_failures(
        &self,
        cancel: &CancelToken,
    ) -> Result<u64, SyncError> {
        let ids = self.store.decrypt_failed_ids()?;
        if ids.is_empty() {
            return Ok(0);
        }
        info!("Attempting decryption repair for {} records", ids.len());

        let mut repaired = 0u64;
        for id in ids {
            let remote = match self.fetch_single(cancel, &id).await? {
                Some(remote) => remote,
                None => break, // cancelled; the next rotation retries
            };
            match remote {
                None => {
                    self.store.delete_record(&id)?;
                    self.cache.apply_delete(&id);
                }
                Some(remote) => match decrypt_remote(&*self.keys, &remote).await {
                    Ok(content) => {
                        self.store.upsert_record(&self.seal(&remote, &content, false)?)?;
                        self.cache.apply_upsert(Record {
                            id: remote.id.clone(),
                            order: remote.order,
                            time: remote.time,
                            content,
                        });
                        repaired += 1;
                    }
                    Err(e) => {
                        debug!("Record {} still undecryptable: {}", id, e);
                    }
                },
            }
        }

        if repaired > 0 {
            info!("Decryption repair recovered {} records", repaired);
        }
        Ok(repaired)
    }

    fn seal(
        &self,
        remote: &RemoteRecord,
        content: &RecordContent,
        decrypt_failed: bool,
    ) -> Result<SealedRecord, SyncError> {
        Ok(SealedRecord {
            id: remote.id.clone(),
            order: remote.order,
            time: remote.time,
            content: self
                .cipher
                .seal_content(content)
                .map_err(|e| SyncError::Corrupt(e.to_string()))?,
            decrypt_failed,
        })
    }

    async fn fetch_events(
        &self,
        cancel: &CancelToken,
        cursor: &str,
    ) -> Result<Option<EventBatch>, SyncError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.transport.fetch_events_since(cursor).await {
                Ok(batch) => return Ok(Some(batch)),
                Err(e) => attempt = self.next_attempt(attempt, e).await?,
            }
        }
    }

    async fn fetch_single(
        &self,
        cancel: &CancelToken,
        id: &str,
    ) -> Result<Option<Option<RemoteRecord>>, SyncError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.transport.fetch_single_record(id).await {
                Ok(remote) => return Ok(Some(remote)),
                Err(e) => attempt = self.next_attempt(attempt, e).await?,
            }
        }
    }

    async fn next_attempt(&self, attempt: u32, error: TransportError) -> Result<u32, SyncError> {
        if !error.retryable() {
            return Err(SyncError::Protocol(format!("transport failure: {}", error)));
        }
        if attempt >= self.config.max_retries {
            return Err(SyncError::Transient(error));
        }
        let delay = self.config.backoff_delay(attempt);
        debug!(
            "Transient event fetch failure ({}), retry {} in {:?}",
            error,
            attempt + 1,
            delay
        );
        tokio::time::sleep(delay).await;
        Ok(attempt + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IndexKey;
    use crate::testing::{MockKeys, MockTransport};

    struct Fixture {
        transport: Arc<MockTransport>,
        keys: Arc<MockKeys>,
        store: Arc<Store>,
        cache: Arc<Cache>,
        sync: EventSynchronizer,
    }

    fn fixture() -> Fixture {
        let keys = Arc::new(MockKeys::new());
        let transport = Arc::new(MockTransport::with_records(&keys, 0));
        let store = Arc::new(Store::in_memory().unwrap());
        let cipher = Arc::new(IndexCipher::new(&IndexKey::generate()));
        let cache = Arc::new(Cache::new(usize::MAX));
        store.set_event_cursor("c0").unwrap();

        let config = EngineConfig {
            base_backoff: std::time::Duration::from_millis(1),
            max_backoff: std::time::Duration::from_millis(4),
            max_retries: 2,
            ..Default::default()
        };
        let sync = EventSynchronizer::new(
            transport.clone(),
            keys.clone(),
            store.clone(),
            cipher,
            cache.clone(),
            config,
        );
        Fixture {
            transport,
            keys,
            store,
            cache,
            sync,
        }
    }

    fn create_batch(
        transport: &MockTransport,
        keys: &MockKeys,
        cursor: &str,
        more: bool,
        ids: &[(&str, u64, i64)],
    ) -> EventBatch {
        EventBatch {
            cursor: cursor.to_string(),
            more_available: more,
            refresh_required: false,
            key_rotated: false,
            mutations: ids
                .iter()
                .map(|&(id, order, time)| {
                    EventMutation::Create(transport.make_remote(keys, id, order, time))
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_catch_up_with_no_events_is_a_noop() {
        let f = fixture();
        let outcome = f.sync.catch_up(&CancelToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Applied {
                cursor: "c0".into(),
                applied: 0
            }
        );
        assert_eq!(f.store.event_cursor().unwrap().as_deref(), Some("c0"));
    }

    #[tokio::test]
    async fn test_catch_up_applies_chain_in_order_then_advances_cursor() {
        let f = fixture();
        let batch1 = create_batch(&f.transport, &f.keys, "c1", true, &[("r1", 1, 100)]);
        // r1 is later updated and r2 created+deleted within the chain
        let updated = f.transport.make_remote(&f.keys, "r1", 1, 150);
        let batch2 = EventBatch {
            cursor: "c2".into(),
            more_available: false,
            refresh_required: false,
            key_rotated: false,
            mutations: vec![
                EventMutation::Update(updated),
                EventMutation::Create(f.transport.make_remote(&f.keys, "r2", 2, 200)),
                EventMutation::Delete { id: "r2".into() },
            ],
        };
        f.transport.set_events("c0", batch1);
        f.transport.set_events("c1", batch2);

        let outcome = f.sync.catch_up(&CancelToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Applied {
                cursor: "c2".into(),
                applied: 4
            }
        );
        assert_eq!(f.store.event_cursor().unwrap().as_deref(), Some("c2"));
        assert_eq!(f.store.get_record("r1").unwrap().unwrap().time, 150);
        assert!(f.store.get_record("r2").unwrap().is_none());

        // Cache mirrored the store
        assert_eq!(f.cache.get("r1").unwrap().record.time, 150);
        assert!(f.cache.get("r2").is_none());
    }

    #[tokio::test]
    async fn test_catch_up_twice_is_idempotent() {
        let f = fixture();
        let batch = create_batch(&f.transport, &f.keys, "c1", false, &[("r1", 1, 100)]);
        f.transport.set_events("c0", batch);

        f.sync.catch_up(&CancelToken::new()).await.unwrap();
        let calls_after_first = f.transport.event_fetches();

        // No new server state: the second call is a no-op
        let outcome = f.sync.catch_up(&CancelToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Applied {
                cursor: "c1".into(),
                applied: 0
            }
        );
        assert_eq!(f.store.count_records().unwrap(), 1);
        assert_eq!(f.transport.event_fetches(), calls_after_first + 1);
    }

    #[tokio::test]
    async fn test_failed_chain_leaves_cursor_and_retry_converges() {
        let f = fixture();
        let batch = create_batch(&f.transport, &f.keys, "c1", false, &[("r1", 1, 100)]);
        f.transport.set_events("c0", batch);

        // Non-retryable failure on the first fetch
        f.transport.fail_next(1, TransportError::Status(500));
        let result = f.sync.catch_up(&CancelToken::new()).await;
        assert!(matches!(result, Err(SyncError::Protocol(_))));
        assert_eq!(f.store.event_cursor().unwrap().as_deref(), Some("c0"));
        assert_eq!(f.store.count_records().unwrap(), 0);

        // Retrying from the original cursor applies the same chain
        let outcome = f.sync.catch_up(&CancelToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Applied {
                cursor: "c1".into(),
                applied: 1
            }
        );
        assert_eq!(f.store.count_records().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_retry_with_bound() {
        let f = fixture();
        let batch = create_batch(&f.transport, &f.keys, "c1", false, &[("r1", 1, 100)]);
        f.transport.set_events("c0", batch);

        f.transport.fail_next(2, TransportError::Status(429));
        let outcome = f.sync.catch_up(&CancelToken::new()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied { applied: 1, .. }));

        // Beyond the bound the transient class surfaces
        f.transport.fail_next(10, TransportError::Status(429));
        let result = f.sync.catch_up(&CancelToken::new()).await;
        assert!(matches!(result, Err(SyncError::Transient(_))));
    }

    #[tokio::test]
    async fn test_refresh_marker_preempts_without_applying() {
        let f = fixture();
        let mut batch = create_batch(&f.transport, &f.keys, "c5", false, &[("r9", 9, 900)]);
        batch.refresh_required = true;
        f.transport.set_events("c0", batch);

        let outcome = f.sync.catch_up(&CancelToken::new()).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::RefreshRequired {
                cursor: "c5".into()
            }
        );
        // Strict preemption: no mutation applied, cursor untouched
        assert_eq!(f.store.count_records().unwrap(), 0);
        assert_eq!(f.store.event_cursor().unwrap().as_deref(), Some("c0"));
    }

    #[tokio::test]
    async fn test_cursor_regression_is_a_protocol_violation() {
        let f = fixture();
        let batch1 = EventBatch {
            cursor: "c1".into(),
            more_available: true,
            ..Default::default()
        };
        let batch2 = EventBatch {
            cursor: "c0".into(),
            more_available: false,
            ..Default::default()
        };
        f.transport.set_events("c0", batch1);
        f.transport.set_events("c1", batch2);

        let result = f.sync.catch_up(&CancelToken::new()).await;
        assert!(matches!(result, Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_key_rotation_triggers_repair() {
        let f = fixture();

        // A record that failed decryption at indexing time
        let owner = "owner-r1".to_string();
        f.keys.withhold_owner(&owner);
        let remote = f.transport.make_remote(&f.keys, "r1", 1, 100);
        f.transport.add_record(remote.clone());
        let (content, failed) = match decrypt_remote(&*f.keys, &remote).await {
            Ok(content) => (content, false),
            Err(_) => (RecordContent::default(), true),
        };
        assert!(failed);
        f.store.upsert_record(&f.sync.seal(&remote, &content, failed).unwrap()).unwrap();
        assert_eq!(f.store.count_decrypt_failed().unwrap(), 1);

        // The key becomes available again; a rotation event lands
        f.keys.restore_owner(&owner);
        let batch = EventBatch {
            cursor: "c1".into(),
            key_rotated: true,
            ..Default::default()
        };
        f.transport.set_events("c0", batch);

        let outcome = f.sync.catch_up(&CancelToken::new()).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Applied { .. }));
        assert_eq!(f.store.count_decrypt_failed().unwrap(), 0);

        let sealed = f.store.get_record("r1").unwrap().unwrap();
        let restored = f.sync.cipher.open_content(&sealed.content).unwrap();
        assert_eq!(restored.subject, "subject r1");
    }

    #[tokio::test]
    async fn test_repair_drops_records_gone_from_server() {
        let f = fixture();

        let owner = "owner-gone".to_string();
        f.keys.withhold_owner(&owner);
        let remote = RemoteRecord {
            id: "gone".into(),
            order: 1,
            time: 100,
            owner,
            payload: vec![0u8; 16],
        };
        f.store
            .upsert_record(&f.sync.seal(&remote, &RecordContent::default(), true).unwrap())
            .unwrap();

        // Not present in the transport's record set
        let repaired = f
            .sync
            .repair_decrypt_failures(&CancelToken::new())
            .await
            .unwrap();
        assert_eq!(repaired, 0);
        assert!(f.store.get_record("gone").unwrap().is_none());
    }
}
