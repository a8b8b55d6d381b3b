//! Per-account engine facade.
//!
//! One `EncryptedSearchEngine` instance owns all state for one account:
//! the sealed store, the decrypted cache, the search generation, the sync
//! queue and the build/refresh state machine. Construct one per account
//! session; there is no global keyed state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::builder::{BuildOutcome, IndexBuilder};
use crate::cache::Cache;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::crypto::{IndexCipher, KeyProvider};
use crate::error::{BuildError, EngineError, SearchError, SyncError};
use crate::metrics::{MetricsEvent, MetricsSink};
use crate::search::{SearchEngine, SearchOutput};
use crate::store::Store;
use crate::sync::{EventSynchronizer, SyncOutcome};
use crate::transport::Transport;
use crate::types::{BuildProgress, SearchCursor, SearchParams};

/// The engine's exclusive long-running operation. Building and refreshing
/// cannot both be in flight: the variant holds the single cancel token.
enum Phase {
    Idle,
    Building { cancel: CancelToken },
    Refreshing { cancel: CancelToken },
}

/// Point-in-time status snapshot for the caller (UI layer).
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub is_building: bool,
    pub is_refreshing: bool,
    pub is_searching: bool,
    pub is_cache_limited: bool,
    pub enabled: bool,
    pub indexing_done: bool,
    pub progress: BuildProgress,
    pub decrypt_failures: u64,
    /// Set when storage failed its integrity check or the sync protocol
    /// broke beyond the retry bound. The only recovery is `wipe` followed
    /// by a fresh build.
    pub corrupt: bool,
}

enum SyncJob {
    CatchUp,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<Store>,
    cache: Arc<Cache>,
    cipher: Arc<IndexCipher>,
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyProvider>,
    metrics: Arc<dyn MetricsSink>,
    search: SearchEngine,
    phase: Mutex<Phase>,
    active_searches: AtomicU64,
    first_search_done: AtomicBool,
    corrupt: AtomicBool,
}

#[derive(Clone)]
pub struct EncryptedSearchEngine {
    inner: Arc<EngineInner>,
    sync_tx: flume::Sender<SyncJob>,
}

impl EncryptedSearchEngine {
    /// Open (or create) the index for one account. On an existing
    /// database this recovers where the last session left off: a finished
    /// index schedules an event catch-up, an unfinished unpaused build
    /// resumes in the background.
    pub async fn open(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        keys: Arc<dyn KeyProvider>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, EngineError> {
        let store = Arc::new(match &config.db_path {
            Some(path) => Store::open(path)?,
            None => Store::in_memory()?,
        });
        store.self_check()?;

        let index_key = keys.index_key().await?;
        let cipher = Arc::new(IndexCipher::new(&index_key));
        let cache = Arc::new(Cache::new(config.cache_budget_bytes));
        let search = SearchEngine::new(
            store.clone(),
            cache.clone(),
            cipher.clone(),
            config.search_page_size,
            config.uncached_scan_ceiling,
        );

        let inner = Arc::new(EngineInner {
            config,
            store,
            cache,
            cipher,
            transport,
            keys,
            metrics,
            search,
            phase: Mutex::new(Phase::Idle),
            active_searches: AtomicU64::new(0),
            first_search_done: AtomicBool::new(false),
            corrupt: AtomicBool::new(false),
        });

        let (sync_tx, sync_rx) = flume::unbounded();
        tokio::spawn(sync_worker(inner.clone(), sync_rx));

        let engine = Self { inner, sync_tx };

        if engine.inner.store.indexing_done()? {
            if engine.inner.store.enabled()? {
                engine.inner.cache.refresh(&engine.inner.store, &engine.inner.cipher)?;
            }
            // Catch up with whatever happened while the session was away
            engine.queue_catch_up();
        } else if engine.inner.store.build_progress()?.is_some() && !engine.inner.store.paused()? {
            info!("Unfinished index build found, resuming");
            let resume = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = resume.start_build().await {
                    warn!("Background build resume failed: {}", e);
                }
            });
        }

        Ok(engine)
    }

    // -----------------------------------------------------------------
    // Build lifecycle
    // -----------------------------------------------------------------

    /// Run the bulk index build to completion (or abortion via pause).
    /// Fails with `BuildError::Busy` if a build or refresh is already in
    /// flight.
    pub async fn start_build(&self) -> Result<BuildOutcome, BuildError> {
        let cancel = {
            let mut phase = self.inner.phase.lock().await;
            match &*phase {
                Phase::Idle => {
                    let cancel = CancelToken::new();
                    *phase = Phase::Building {
                        cancel: cancel.clone(),
                    };
                    cancel
                }
                _ => return Err(BuildError::Busy),
            }
        };

        let result = self.run_build(&cancel).await;

        *self.inner.phase.lock().await = Phase::Idle;
        result
    }

    async fn run_build(&self, cancel: &CancelToken) -> Result<BuildOutcome, BuildError> {
        let started = Instant::now();

        // Anchor the event stream before indexing so every change that
        // lands mid-build is caught up afterwards.
        if self.inner.store.event_cursor()?.is_none() {
            let latest = self
                .inner
                .transport
                .latest_cursor()
                .await
                .map_err(|e| {
                    if e.retryable() {
                        BuildError::Transient(e)
                    } else {
                        BuildError::Transport(e)
                    }
                })?;
            self.inner.store.set_event_cursor(&latest)?;
        }

        self.inner.store.set_enabled(true)?;
        self.inner.store.set_paused(false)?;

        let builder = IndexBuilder::new(
            self.inner.transport.clone(),
            self.inner.keys.clone(),
            self.inner.store.clone(),
            self.inner.cipher.clone(),
            self.inner.config.clone(),
        );
        let outcome = builder.build(cancel).await?;

        if let BuildOutcome::Completed { indexed, skipped } = &outcome {
            self.inner.store.set_indexing_done(true)?;
            self.inner.store.clear_build_cursor()?;
            self.inner
                .cache
                .refresh(&self.inner.store, &self.inner.cipher)?;
            self.inner.metrics.report(MetricsEvent::BuildCompleted {
                records_indexed: *indexed,
                records_skipped: *skipped,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
            // Catch up with events that accumulated during the build
            self.queue_catch_up();
        }

        Ok(outcome)
    }

    /// Cooperatively stop a running build and persist the paused flag so
    /// a restart does not silently resume it.
    pub async fn pause_build(&self) -> Result<(), EngineError> {
        {
            let phase = self.inner.phase.lock().await;
            if let Phase::Building { cancel } = &*phase {
                cancel.cancel();
            }
        }
        self.inner.store.set_paused(true)?;
        Ok(())
    }

    /// Clear the paused flag and continue from the stored progress.
    pub async fn resume_build(&self) -> Result<BuildOutcome, BuildError> {
        self.inner.store.set_paused(false)?;
        self.start_build().await
    }

    // -----------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------

    /// Feed a server event notification. Catch-ups are serialized behind
    /// a FIFO queue drained by a single worker task; two can never run
    /// concurrently.
    pub fn on_event(&self) {
        self.queue_catch_up();
    }

    fn queue_catch_up(&self) {
        let _ = self.sync_tx.send(SyncJob::CatchUp);
    }

    // -----------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------

    /// Execute a search. A call immediately invalidates any in-flight
    /// one; the superseded call's output is discarded, never published.
    pub async fn search(
        &self,
        params: SearchParams,
        cursor: Option<SearchCursor>,
    ) -> Result<SearchOutput, SearchError> {
        if !self.inner.store.enabled()? {
            return Err(SearchError::Disabled);
        }

        let started = Instant::now();
        self.inner.active_searches.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.search.search(params, cursor).await;
        self.inner.active_searches.fetch_sub(1, Ordering::SeqCst);

        if let Ok(output) = &result {
            let is_first = !self.inner.first_search_done.swap(true, Ordering::SeqCst);
            self.inner.metrics.report(MetricsEvent::SearchCompleted {
                cache_bytes: self.inner.cache.resident_bytes(),
                records_searched: output.examined,
                elapsed_ms: started.elapsed().as_millis() as u64,
                results_found: output.results.len(),
                is_first_search: is_first,
                is_cache_limited: self.inner.cache.is_limited(),
            });
        }

        result
    }

    pub fn cancel_search(&self) {
        self.inner.search.cancel();
    }

    /// Whether the record belongs to the current result set.
    pub fn is_search_result(&self, id: &str) -> bool {
        self.inner.search.is_result(id)
    }

    // -----------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (is_building, is_refreshing) = {
            let phase = self.inner.phase.lock().await;
            match &*phase {
                Phase::Idle => (false, false),
                Phase::Building { .. } => (true, false),
                Phase::Refreshing { .. } => (false, true),
            }
        };

        Ok(EngineStatus {
            is_building,
            is_refreshing,
            is_searching: self.inner.active_searches.load(Ordering::SeqCst) > 0,
            is_cache_limited: self.inner.cache.is_limited(),
            enabled: self.inner.store.enabled()?,
            indexing_done: self.inner.store.indexing_done()?,
            progress: self.inner.store.build_progress()?.unwrap_or_default(),
            decrypt_failures: self.inner.store.count_decrypt_failed()?,
            corrupt: self.inner.corrupt.load(Ordering::SeqCst),
        })
    }

    /// Toggle encrypted search availability. Disabling aborts any
    /// in-flight search and drops held results.
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        self.inner.store.set_enabled(enabled)?;
        if !enabled {
            self.inner.search.reset();
        }
        Ok(())
    }

    /// Delete all durable state and flags. Used on corruption or explicit
    /// disable; the engine stays usable for a fresh `start_build`.
    pub async fn wipe(&self) -> Result<(), EngineError> {
        info!("Wiping encrypted search state");
        {
            let phase = self.inner.phase.lock().await;
            match &*phase {
                Phase::Building { cancel } | Phase::Refreshing { cancel } => cancel.cancel(),
                Phase::Idle => {}
            }
        }
        self.inner.search.reset();
        self.inner.cache.clear();
        self.inner.store.wipe()?;
        self.inner.corrupt.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Sync worker
// ---------------------------------------------------------------------

/// Single consumer of the sync queue: event catch-ups for this account
/// run strictly one at a time, in arrival order.
async fn sync_worker(inner: Arc<EngineInner>, rx: flume::Receiver<SyncJob>) {
    while let Ok(job) = rx.recv_async().await {
        match job {
            SyncJob::CatchUp => run_catch_up(&inner).await,
        }
    }
    debug!("Sync worker shutting down");
}

async fn run_catch_up(inner: &Arc<EngineInner>) {
    match inner.store.indexing_done() {
        Ok(true) => {}
        Ok(false) => {
            // Build completion is a precondition for the first catch-up
            debug!("Skipping catch-up, index build not finished");
            return;
        }
        Err(e) => {
            error!("Cannot read indexing state: {}", e);
            inner.corrupt.store(true, Ordering::SeqCst);
            return;
        }
    }

    let sync = EventSynchronizer::new(
        inner.transport.clone(),
        inner.keys.clone(),
        inner.store.clone(),
        inner.cipher.clone(),
        inner.cache.clone(),
        inner.config.clone(),
    );

    let mut violations = 0u32;
    loop {
        match sync.catch_up(&CancelToken::new()).await {
            Ok(SyncOutcome::Applied { applied, .. }) => {
                if applied > 0 {
                    // Deletions may have freed cache space; refill it
                    if let Err(e) = inner.cache.refresh(&inner.store, &inner.cipher) {
                        warn!("Cache refresh after sync failed: {}", e);
                    }
                    inner.metrics.report(MetricsEvent::SyncApplied {
                        mutations_applied: applied,
                    });
                }
                return;
            }
            Ok(SyncOutcome::RefreshRequired { cursor }) => {
                run_refresh(inner, &cursor).await;
                return;
            }
            Ok(SyncOutcome::Aborted) => return,
            Err(SyncError::Transient(e)) => {
                // Already retried to the bound inside; the next event
                // will try again from the same cursor
                warn!("Catch-up gave up on transient failure: {}", e);
                return;
            }
            Err(SyncError::Protocol(e)) => {
                violations += 1;
                if violations > inner.config.max_protocol_violations {
                    error!("Protocol violations beyond bound, marking index corrupt: {}", e);
                    inner.corrupt.store(true, Ordering::SeqCst);
                    return;
                }
                warn!(
                    "Sync protocol violation ({} of {}), retrying from last good cursor: {}",
                    violations, inner.config.max_protocol_violations, e
                );
            }
            Err(SyncError::Store(e)) => {
                error!("Store failure during catch-up: {}", e);
                inner.corrupt.store(true, Ordering::SeqCst);
                return;
            }
            Err(SyncError::Corrupt(e)) => {
                error!("Corruption detected during catch-up: {}", e);
                inner.corrupt.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Full refresh: re-walk the whole server corpus, upserting everything,
/// then drop local rows the walk did not touch and jump the cursor past
/// the refresh point. Strict preemption of incremental syncing: the
/// dropped mutations all described state the re-walk reads directly.
async fn run_refresh(inner: &Arc<EngineInner>, cursor_after: &str) {
    let cancel = {
        let mut phase = inner.phase.lock().await;
        match &*phase {
            Phase::Idle => {
                let cancel = CancelToken::new();
                *phase = Phase::Refreshing {
                    cancel: cancel.clone(),
                };
                cancel
            }
            _ => {
                // A build owns the store right now; its completion
                // catch-up will see the refresh marker again
                debug!("Refresh deferred, another operation is running");
                return;
            }
        }
    };

    info!("Starting full index refresh");
    let started_ms = chrono::Utc::now().timestamp_millis();

    let result = async {
        inner.store.clear_build_state()?;
        let builder = IndexBuilder::new(
            inner.transport.clone(),
            inner.keys.clone(),
            inner.store.clone(),
            inner.cipher.clone(),
            inner.config.clone(),
        );
        let outcome = builder.build(&cancel).await?;

        if let BuildOutcome::Completed { .. } = outcome {
            let dropped = inner.store.delete_updated_before(started_ms)?;
            if dropped > 0 {
                info!("Refresh dropped {} stale records", dropped);
            }
            inner.store.set_event_cursor(cursor_after)?;
            inner.store.set_indexing_done(true)?;
            inner.store.clear_build_cursor()?;
            inner.cache.refresh(&inner.store, &inner.cipher)?;
        }
        Ok::<BuildOutcome, BuildError>(outcome)
    }
    .await;

    *inner.phase.lock().await = Phase::Idle;

    match result {
        Ok(BuildOutcome::Completed { indexed, .. }) => {
            info!("Index refresh completed with {} records", indexed);
        }
        Ok(BuildOutcome::Aborted) => {
            info!("Index refresh aborted");
        }
        Err(e) => {
            // Cursor not advanced: the refresh marker will be seen again
            warn!("Index refresh failed, will retry on next event: {}", e);
        }
    }
}
