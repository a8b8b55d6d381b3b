//! Bounded in-memory working set of decrypted records.
//!
//! The cache is a read accelerator over the store, never a source of
//! truth. It fills newest-first until its byte budget is exhausted; once
//! the budget has been hit the cache reports itself limited for the rest
//! of the session, so the search engine knows a disk fallback may be
//! needed even after deletions free space.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::crypto::IndexCipher;
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Record, SearchCursor};

/// Fixed accounting overhead per resident entry, on top of field bytes.
const ENTRY_OVERHEAD_BYTES: usize = 200;

/// Page size used when filling the cache from the store.
const REFRESH_PAGE: usize = 256;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub record: Record,
    pub size_bytes: usize,
}

impl CacheEntry {
    fn new(record: Record) -> Self {
        let content = &record.content;
        let size_bytes = ENTRY_OVERHEAD_BYTES
            + record.id.len()
            + content.subject.len()
            + content.sender.len()
            + content.recipients.iter().map(String::len).sum::<usize>()
            + content.labels.iter().map(String::len).sum::<usize>()
            + content.body.len();
        Self { record, size_bytes }
    }
}

/// Immutable view handed to searches. A refresh concurrent with an
/// in-flight search swaps the live vector but cannot touch a snapshot.
#[derive(Clone)]
pub struct CacheSnapshot {
    entries: Arc<Vec<Arc<CacheEntry>>>,
    limited: bool,
}

impl CacheSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CacheEntry>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn limited(&self) -> bool {
        self.limited
    }

    /// Position of the oldest resident record; where a disk scan takes
    /// over from the cache.
    pub fn oldest(&self) -> Option<SearchCursor> {
        self.entries.last().map(|entry| SearchCursor {
            order: entry.record.order,
            time: entry.record.time,
        })
    }
}

struct Inner {
    /// Sorted by (time, order) descending.
    entries: Vec<Arc<CacheEntry>>,
    by_id: HashMap<String, Arc<CacheEntry>>,
    total_bytes: usize,
}

pub struct Cache {
    budget_bytes: usize,
    inner: RwLock<Inner>,
    /// Sticky for the session: set the first time the budget is hit,
    /// never cleared by partial reloads.
    limited: AtomicBool,
}

impl Cache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                by_id: HashMap::new(),
                total_bytes: 0,
            }),
            limited: AtomicBool::new(false),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limited.load(Ordering::SeqCst)
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner.read().unwrap().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<CacheEntry>> {
        self.inner.read().unwrap().by_id.get(id).cloned()
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let inner = self.inner.read().unwrap();
        CacheSnapshot {
            entries: Arc::new(inner.entries.clone()),
            limited: self.is_limited(),
        }
    }

    /// Rebuild the working set from the store, newest-first, stopping at
    /// the byte budget. Idempotent and safe while a search is running:
    /// searches iterate snapshots, not the live vector.
    pub fn refresh(&self, store: &Store, cipher: &IndexCipher) -> Result<(), StoreError> {
        let mut entries: Vec<Arc<CacheEntry>> = Vec::new();
        let mut by_id = HashMap::new();
        let mut total_bytes = 0usize;
        let mut cursor: Option<SearchCursor> = None;
        let mut budget_hit = false;

        'fill: loop {
            let page = store.scan_before(cursor, REFRESH_PAGE)?;
            if page.is_empty() {
                break;
            }
            cursor = page.last().map(|record| SearchCursor {
                order: record.order,
                time: record.time,
            });

            for sealed in page {
                let content = match cipher.open_content(&sealed.content) {
                    Ok(content) => content,
                    Err(e) => {
                        warn!("Skipping unreadable cached record {}: {}", sealed.id, e);
                        continue;
                    }
                };
                let entry = Arc::new(CacheEntry::new(Record {
                    id: sealed.id,
                    order: sealed.order,
                    time: sealed.time,
                    content,
                }));

                if total_bytes + entry.size_bytes > self.budget_bytes && !entries.is_empty() {
                    budget_hit = true;
                    break 'fill;
                }
                total_bytes += entry.size_bytes;
                by_id.insert(entry.record.id.clone(), entry.clone());
                entries.push(entry);
            }
        }

        if budget_hit {
            self.limited.store(true, Ordering::SeqCst);
        }

        debug!(
            "Cache refreshed: {} records, {} bytes, limited={}",
            entries.len(),
            total_bytes,
            self.is_limited()
        );

        let mut inner = self.inner.write().unwrap();
        inner.entries = entries;
        inner.by_id = by_id;
        inner.total_bytes = total_bytes;
        Ok(())
    }

    /// Insert or replace one decrypted record, keeping sort order and
    /// evicting whole entries from the old end if the budget overflows.
    pub fn apply_upsert(&self, record: Record) {
        let entry = Arc::new(CacheEntry::new(record));
        let mut inner = self.inner.write().unwrap();

        if let Some(existing) = inner.by_id.remove(&entry.record.id) {
            if let Some(pos) = inner
                .entries
                .iter()
                .position(|e| e.record.id == existing.record.id)
            {
                inner.entries.remove(pos);
            }
            inner.total_bytes -= existing.size_bytes;
        }

        let key = entry.record.sort_key();
        let pos = inner
            .entries
            .partition_point(|e| e.record.sort_key() > key);
        inner.total_bytes += entry.size_bytes;
        inner.by_id.insert(entry.record.id.clone(), entry.clone());
        inner.entries.insert(pos, entry);

        while inner.total_bytes > self.budget_bytes && inner.entries.len() > 1 {
            if let Some(evicted) = inner.entries.pop() {
                inner.total_bytes -= evicted.size_bytes;
                inner.by_id.remove(&evicted.record.id);
                self.limited.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn apply_delete(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.by_id.remove(id) {
            if let Some(pos) = inner.entries.iter().position(|e| e.record.id == id) {
                inner.entries.remove(pos);
            }
            inner.total_bytes -= existing.size_bytes;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.entries.clear();
        inner.by_id.clear();
        inner.total_bytes = 0;
    }
}
