//! Hybrid query execution.
//!
//! A search scans the in-memory cache first (no I/O), then, when the cache
//! does not hold the full corpus, continues with a bounded on-disk scan
//! proceeding strictly backward in time from the oldest cached record.
//! Results merge under the (time, order) sort; a truncated disk scan marks
//! the output partial and hands back a continuation cursor.

pub mod highlight;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::crypto::IndexCipher;
use crate::error::SearchError;
use crate::store::Store;
use crate::types::{Record, SearchCursor, SearchParams, SortDir};

/// Records decrypted per store round-trip during the disk fallback.
const DISK_CHUNK: usize = 128;

#[derive(Debug, Clone)]
pub struct SearchOutput {
    /// Matches found by this call, ordered per `SearchParams::sort`. A
    /// continuation call returns only the newly found page.
    pub results: Vec<Record>,
    /// Present when the corpus was not exhausted; encodes the last
    /// considered (order, time) position for the next call.
    pub next_cursor: Option<SearchCursor>,
    /// True when the disk fallback stopped at its ceiling or page bound
    /// rather than exhausting the corpus.
    pub partial: bool,
    /// Records considered by this call (cache plus disk); zero on the
    /// sort-only fast path.
    pub examined: u64,
}

/// Accumulated state of the most recent search, kept in canonical
/// time-descending order regardless of the requested sort.
struct SearchState {
    params: SearchParams,
    results: Vec<Record>,
    partial: bool,
    next_cursor: Option<SearchCursor>,
}

pub struct SearchEngine {
    store: Arc<Store>,
    cache: Arc<Cache>,
    cipher: Arc<IndexCipher>,
    page_size: usize,
    scan_ceiling: usize,
    /// Generation token: a new search (or an explicit cancel) bumps it,
    /// and an in-flight search whose generation no longer matches is
    /// discarded before it can touch shared state.
    generation: AtomicU64,
    state: Mutex<Option<SearchState>>,
}

impl SearchEngine {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<Cache>,
        cipher: Arc<IndexCipher>,
        page_size: usize,
        scan_ceiling: usize,
    ) -> Self {
        Self {
            store,
            cache,
            cipher,
            page_size,
            scan_ceiling,
            generation: AtomicU64::new(0),
            state: Mutex::new(None),
        }
    }

    /// Invalidate any in-flight search without starting a new one.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop all held result state (wipe, disable, leaving search mode).
    pub fn reset(&self) {
        self.cancel();
        *self.state.lock().unwrap() = None;
    }

    /// Whether the record is part of the current result set.
    pub fn is_result(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.results.iter().any(|r| r.id == id))
            .unwrap_or(false)
    }

    pub async fn search(
        &self,
        params: SearchParams,
        cursor: Option<SearchCursor>,
    ) -> Result<SearchOutput, SearchError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Sort-only fast path: same filters, different sort, and the
        // previous result set was complete. Zero store reads.
        if cursor.is_none() {
            let mut state = self.state.lock().unwrap();
            if let Some(previous) = state.as_mut() {
                if !previous.partial
                    && params.same_filters(&previous.params)
                    && params.sort != previous.params.sort
                {
                    debug!("Sort-only search, reordering {} held results", previous.results.len());
                    previous.params = params.clone();
                    return Ok(SearchOutput {
                        results: ordered(&previous.results, params.sort),
                        next_cursor: None,
                        partial: false,
                        examined: 0,
                    });
                }
            }
        }

        let snapshot = self.cache.snapshot();
        let continuation = cursor.is_some();

        // Phase 1: full cache scan. A continuation call already returned
        // the cached hits, so it goes straight to disk.
        let mut hits: Vec<Record> = Vec::new();
        let mut examined = 0u64;
        if !continuation {
            examined += snapshot.len() as u64;
            for entry in snapshot.iter() {
                if params.matches(&entry.record) {
                    hits.push(entry.record.clone());
                }
            }
        }

        // Phase 2: bounded disk fallback when the cache cannot answer
        // conclusively.
        let mut partial = false;
        let mut next_cursor = None;
        if continuation || snapshot.limited() {
            if continuation || hits.len() < self.page_size {
                let start = cursor.or_else(|| snapshot.oldest());
                let needed = self.page_size.saturating_sub(hits.len()).max(1);
                let scan = self.scan_disk(&params, start, needed, generation).await?;
                hits.extend(scan.found);
                partial = scan.partial;
                next_cursor = scan.next_cursor;
                examined += scan.examined;
            } else {
                // Enough cached hits for a page, but older records exist
                // on disk only; let the next call pick up from the cache
                // boundary.
                partial = true;
                next_cursor = snapshot.oldest();
            }
        }

        // Publish only if no newer search supplanted this one.
        let mut state = self.state.lock().unwrap();
        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(SearchError::Superseded);
        }

        let output = SearchOutput {
            results: ordered(&hits, params.sort),
            next_cursor,
            partial,
            examined,
        };

        match state.as_mut() {
            Some(previous) if continuation && params.same_filters(&previous.params) => {
                previous.results.extend(hits);
                previous.partial = partial;
                previous.next_cursor = next_cursor;
                previous.params = params;
            }
            _ => {
                *state = Some(SearchState {
                    params,
                    results: hits,
                    partial,
                    next_cursor,
                });
            }
        }

        Ok(output)
    }

    async fn scan_disk(
        &self,
        params: &SearchParams,
        start: Option<SearchCursor>,
        needed: usize,
        generation: u64,
    ) -> Result<DiskScan, SearchError> {
        let mut found = Vec::new();
        let mut cursor = start;
        let mut examined = 0usize;
        let mut exhausted = false;

        'scan: while examined < self.scan_ceiling {
            if self.generation.load(Ordering::SeqCst) != generation {
                return Err(SearchError::Superseded);
            }

            let chunk = DISK_CHUNK.min(self.scan_ceiling - examined);
            let page = self.store.scan_before(cursor, chunk)?;
            if page.is_empty() {
                exhausted = true;
                break;
            }

            for sealed in page {
                examined += 1;
                cursor = Some(SearchCursor {
                    order: sealed.order,
                    time: sealed.time,
                });

                let content = match self.cipher.open_content(&sealed.content) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!("Skipping unreadable record {} during search: {}", sealed.id, e);
                        continue;
                    }
                };
                let record = Record {
                    id: sealed.id,
                    order: sealed.order,
                    time: sealed.time,
                    content,
                };
                if params.matches(&record) {
                    found.push(record);
                    if found.len() >= needed {
                        break 'scan;
                    }
                }
            }

            // Suspension point between chunks: keeps long scans
            // cooperative and lets cancellation land promptly.
            tokio::task::yield_now().await;
        }

        debug!(
            "Disk scan examined {} records, found {}, exhausted={}",
            examined,
            found.len(),
            exhausted
        );

        Ok(DiskScan {
            found,
            partial: !exhausted,
            next_cursor: if exhausted { None } else { cursor },
            examined: examined as u64,
        })
    }
}

struct DiskScan {
    found: Vec<Record>,
    partial: bool,
    next_cursor: Option<SearchCursor>,
    examined: u64,
}

/// Canonical order is time-descending; ascending output is a reversal.
fn ordered(results: &[Record], sort: SortDir) -> Vec<Record> {
    let mut out = results.to_vec();
    match sort {
        SortDir::Desc => {}
        SortDir::Asc => out.reverse(),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IndexKey;
    use crate::store::SealedRecord;
    use crate::types::RecordContent;

    fn content(subject: &str, body: &str) -> RecordContent {
        RecordContent {
            subject: subject.into(),
            sender: "alice@example.com".into(),
            recipients: vec!["bob@example.com".into()],
            labels: vec!["inbox".into()],
            has_attachments: false,
            body: body.into(),
        }
    }

    /// Store with `count` records, newest last inserted; record `i` has
    /// time `i * 100` and body "needle i".
    fn seed(cipher: &IndexCipher, count: u64) -> Arc<Store> {
        let store = Store::in_memory().unwrap();
        for i in 1..=count {
            store
                .upsert_record(&SealedRecord {
                    id: format!("r{}", i),
                    order: i,
                    time: i as i64 * 100,
                    content: cipher
                        .seal_content(&content(&format!("subject {}", i), &format!("needle {}", i)))
                        .unwrap(),
                    decrypt_failed: false,
                })
                .unwrap();
        }
        Arc::new(store)
    }

    fn engine_with_cache_budget(
        store: Arc<Store>,
        cipher: Arc<IndexCipher>,
        budget: usize,
        page_size: usize,
    ) -> SearchEngine {
        let cache = Arc::new(Cache::new(budget));
        cache.refresh(&store, &cipher).unwrap();
        SearchEngine::new(store, cache, cipher, page_size, 500)
    }

    fn ids(results: &[Record]) -> Vec<&str> {
        results.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_pure_cache_search_is_complete() {
        let cipher = Arc::new(IndexCipher::new(&IndexKey::generate()));
        let store = seed(&cipher, 5);
        let engine = engine_with_cache_budget(store, cipher, usize::MAX, 50);

        let output = engine
            .search(SearchParams::new(["needle"]), None)
            .await
            .unwrap();
        assert_eq!(ids(&output.results), vec!["r5", "r4", "r3", "r2", "r1"]);
        assert!(!output.partial);
        assert!(output.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_limited_cache_falls_back_to_disk() {
        let cipher = Arc::new(IndexCipher::new(&IndexKey::generate()));
        let store = seed(&cipher, 5);
        // Budget for two entries; page size three forces one disk hit
        let engine = engine_with_cache_budget(store, cipher, 2 * 300, 3);
        assert!(engine.cache.is_limited());

        let output = engine
            .search(SearchParams::new(["needle"]), None)
            .await
            .unwrap();
        assert_eq!(ids(&output.results), vec!["r5", "r4", "r3"]);
        assert!(output.partial);
        let cursor = output.next_cursor.expect("continuation cursor");
        assert_eq!(cursor.time, 300);

        // Continuation resumes past r3 without rescanning
        let output = engine
            .search(SearchParams::new(["needle"]), Some(cursor))
            .await
            .unwrap();
        assert_eq!(ids(&output.results), vec!["r2", "r1"]);
        assert!(!output.partial);
        assert!(output.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_sort_only_fast_path_does_no_reads() {
        let cipher = Arc::new(IndexCipher::new(&IndexKey::generate()));
        let store = seed(&cipher, 4);
        let engine = engine_with_cache_budget(store.clone(), cipher, usize::MAX, 50);

        let params = SearchParams::new(["needle"]);
        let first = engine.search(params.clone(), None).await.unwrap();
        assert!(!first.partial);

        let reads_before = store.scan_reads();
        let second = engine
            .search(params.with_sort(SortDir::Asc), None)
            .await
            .unwrap();
        assert_eq!(store.scan_reads(), reads_before, "fast path must not touch the store");
        assert_eq!(ids(&second.results), vec!["r1", "r2", "r3", "r4"]);
    }

    #[tokio::test]
    async fn test_changed_filters_bypass_fast_path() {
        let cipher = Arc::new(IndexCipher::new(&IndexKey::generate()));
        let store = seed(&cipher, 4);
        let engine = engine_with_cache_budget(store, cipher, usize::MAX, 50);

        engine
            .search(SearchParams::new(["needle"]), None)
            .await
            .unwrap();
        let output = engine
            .search(SearchParams::new(["needle 2"]).with_sort(SortDir::Asc), None)
            .await
            .unwrap();
        assert_eq!(ids(&output.results), vec!["r2"]);
    }

    #[tokio::test]
    async fn test_scan_ceiling_truncates_and_reports_partial() {
        let cipher = Arc::new(IndexCipher::new(&IndexKey::generate()));
        let store = seed(&cipher, 20);
        let cache = Arc::new(Cache::new(300));
        cache.refresh(&store, &cipher).unwrap();
        assert!(cache.is_limited());
        // Ceiling of 5 examined records per call
        let engine = SearchEngine::new(store, cache, cipher, 50, 5);

        let output = engine
            .search(SearchParams::new(["no-such-needle"]), None)
            .await
            .unwrap();
        assert!(output.results.is_empty());
        assert!(output.partial);
        assert!(output.next_cursor.is_some());
    }

    #[tokio::test]
    async fn test_superseding_search_discards_predecessor() {
        let cipher = Arc::new(IndexCipher::new(&IndexKey::generate()));
        let store = seed(&cipher, 3);
        let engine = Arc::new(engine_with_cache_budget(store, cipher, usize::MAX, 50));

        // Simulate search B arriving while A is mid-flight
        let generation_a = engine.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let output_b = engine
            .search(SearchParams::new(["needle 2"]), None)
            .await
            .unwrap();
        assert_eq!(ids(&output_b.results), vec!["r2"]);

        // A completes late: its publish must be refused
        let scan = engine
            .scan_disk(&SearchParams::new(["needle"]), None, 10, generation_a)
            .await;
        assert!(matches!(scan, Err(SearchError::Superseded)));

        // B's state survived
        assert!(engine.is_result("r2"));
        assert!(!engine.is_result("r1"));
    }

    #[tokio::test]
    async fn test_cached_hits_fill_page_cursor_points_at_cache_boundary() {
        let cipher = Arc::new(IndexCipher::new(&IndexKey::generate()));
        let store = seed(&cipher, 6);
        // Cache holds 3 newest, page size 2
        let engine = engine_with_cache_budget(store, cipher, 3 * 300, 2);
        assert!(engine.cache.is_limited());

        let output = engine
            .search(SearchParams::new(["needle"]), None)
            .await
            .unwrap();
        assert_eq!(ids(&output.results), vec!["r6", "r5", "r4"]);
        assert!(output.partial);
        // Continuation starts below the oldest cached record
        assert_eq!(output.next_cursor.unwrap().time, 400);
    }
}
