//! Bulk indexing pipeline.
//!
//! Pages through every server record, decrypts each with its owner's key,
//! re-seals it under the index key and commits page by page. Each page
//! commit carries progress and the resume cursor in the same transaction,
//! so an interrupted build continues from its last durable page instead of
//! starting over, and no partial page ever hits the store.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::crypto::{CryptoError, IndexCipher, KeyProvider};
use crate::error::BuildError;
use crate::store::{SealedRecord, Store};
use crate::transport::{RemoteRecord, Transport, TransportError};
use crate::types::{BuildCursor, BuildProgress, RecordContent};

/// Terminal states of a build. Abortion is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Completed { indexed: u64, skipped: u64 },
    Aborted,
}

pub type ProgressCallback = Box<dyn Fn(BuildProgress) + Send + Sync>;

pub struct IndexBuilder {
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyProvider>,
    store: Arc<Store>,
    cipher: Arc<IndexCipher>,
    config: EngineConfig,
    on_progress: Option<ProgressCallback>,
}

impl IndexBuilder {
    pub fn new(
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyProvider>,
        store: Arc<Store>,
        cipher: Arc<IndexCipher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            transport,
            keys,
            store,
            cipher,
            config,
            on_progress: None,
        }
    }

    /// Progress callbacks fire at page boundaries only, bounding update
    /// frequency.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub async fn build(&self, cancel: &CancelToken) -> Result<BuildOutcome, BuildError> {
        let started = Instant::now();
        let mut skipped = 0u64;

        let mut progress = match self.store.build_progress()? {
            Some(progress) => progress,
            None => {
                let total = match self.fetch_count(cancel).await? {
                    Some(total) => total,
                    None => return Ok(BuildOutcome::Aborted),
                };
                let progress = BuildProgress {
                    records_done: 0,
                    records_total: total,
                };
                self.store.set_build_progress(&progress)?;
                progress
            }
        };
        let mut cursor = self.store.build_cursor()?;

        info!(
            "Index build starting at {}/{}",
            progress.records_done, progress.records_total
        );

        loop {
            if cancel.is_cancelled() {
                info!("Index build aborted at {} records", progress.records_done);
                return Ok(BuildOutcome::Aborted);
            }

            let page = match self.fetch_page(cancel, cursor.as_ref()).await? {
                Some(page) => page,
                None => return Ok(BuildOutcome::Aborted),
            };
            if page.is_empty() {
                break;
            }

            // A cancellation landing during the fetch discards the page:
            // nothing is committed past this check.
            if cancel.is_cancelled() {
                info!("Index build aborted, discarding uncommitted page");
                return Ok(BuildOutcome::Aborted);
            }

            let (sealed_page, page_skipped, next_cursor) = self.seal_page(page).await?;
            skipped += page_skipped;
            progress.records_done += sealed_page.len() as u64;

            self.store
                .put_page(&sealed_page, &progress, Some(&next_cursor))?;
            cursor = Some(next_cursor);

            if let Some(callback) = &self.on_progress {
                callback(progress);
            }
        }

        // The server corpus may have shrunk or grown since the initial
        // count; the final total is what was actually indexed.
        if progress.records_done != progress.records_total {
            progress.records_total = progress.records_done;
            self.store.set_build_progress(&progress)?;
        }

        info!(
            "Index build completed: {} records ({} skipped) in {:?}",
            progress.records_done,
            skipped,
            started.elapsed()
        );

        Ok(BuildOutcome::Completed {
            indexed: progress.records_done,
            skipped,
        })
    }

    /// Decrypt, re-seal and order one fetched page, newest first. Records
    /// whose payload cannot be decrypted become flagged placeholders; the
    /// build never fails on a single record.
    async fn seal_page(
        &self,
        mut page: Vec<RemoteRecord>,
    ) -> Result<(Vec<SealedRecord>, u64, BuildCursor), BuildError> {
        page.sort_by(|a, b| (b.time, b.order).cmp(&(a.time, a.order)));

        let mut sealed_page = Vec::with_capacity(page.len());
        let mut skipped = 0u64;
        for remote in &page {
            let (content, decrypt_failed) = match decrypt_remote(&*self.keys, remote).await {
                Ok(content) => (content, false),
                Err(e) => {
                    warn!("Skipping undecryptable record {}: {}", remote.id, e);
                    skipped += 1;
                    (RecordContent::default(), true)
                }
            };
            sealed_page.push(SealedRecord {
                id: remote.id.clone(),
                order: remote.order,
                time: remote.time,
                content: self.cipher.seal_content(&content)?,
                decrypt_failed,
            });
        }

        // Oldest committed record; the next page is everything older.
        let oldest = page.last().expect("seal_page called with records");
        let next_cursor = BuildCursor {
            end_id: oldest.id.clone(),
            end_time: oldest.time,
            end_order: oldest.order,
        };

        Ok((sealed_page, skipped, next_cursor))
    }

    /// Bounded retry with capped doubling backoff. `None` means cancelled.
    async fn fetch_count(&self, cancel: &CancelToken) -> Result<Option<u64>, BuildError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self.transport.fetch_record_count().await {
                Ok(total) => return Ok(Some(total)),
                Err(e) => attempt = self.next_attempt(attempt, e).await?,
            }
        }
    }

    async fn fetch_page(
        &self,
        cancel: &CancelToken,
        before: Option<&BuildCursor>,
    ) -> Result<Option<Vec<RemoteRecord>>, BuildError> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            match self
                .transport
                .fetch_records_page(before, self.config.build_page_size)
                .await
            {
                Ok(page) => return Ok(Some(page)),
                Err(e) => attempt = self.next_attempt(attempt, e).await?,
            }
        }
    }

    async fn next_attempt(&self, attempt: u32, error: TransportError) -> Result<u32, BuildError> {
        if !error.retryable() {
            return Err(BuildError::Transport(error));
        }
        if attempt >= self.config.max_retries {
            return Err(BuildError::Transient(error));
        }
        let delay = self.config.backoff_delay(attempt);
        debug!(
            "Transient fetch failure ({}), retry {} in {:?}",
            error,
            attempt + 1,
            delay
        );
        tokio::time::sleep(delay).await;
        Ok(attempt + 1)
    }
}

/// Decrypt a server payload with its owner's key. Shared with the event
/// synchronizer, which ingests the same wire shape.
pub(crate) async fn decrypt_remote(
    keys: &dyn KeyProvider,
    remote: &RemoteRecord,
) -> Result<RecordContent, CryptoError> {
    let key = keys
        .owner_key(&remote.owner)
        .await?
        .ok_or_else(|| CryptoError::KeyMissing(remote.owner.clone()))?;
    IndexCipher::new(&key).open_content(&remote.payload)
}
