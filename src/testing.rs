//! In-crate test doubles: a scriptable transport with fault injection and
//! call counting, and a key provider whose per-owner keys can be withheld
//! to force decryption failures.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::crypto::{CryptoError, IndexCipher, IndexKey, KeyProvider};
use crate::transport::{EventBatch, RemoteRecord, Transport, TransportError};
use crate::types::{BuildCursor, RecordContent};

pub struct MockKeys {
    index: IndexKey,
    owners: Mutex<HashMap<String, IndexKey>>,
    withheld: Mutex<HashSet<String>>,
}

impl MockKeys {
    pub fn new() -> Self {
        Self {
            index: IndexKey::generate(),
            owners: Mutex::new(HashMap::new()),
            withheld: Mutex::new(HashSet::new()),
        }
    }

    /// Cipher for sealing a test payload under an owner's key; the key is
    /// created on first use. Sealing works even for withheld owners, so a
    /// payload can exist that the provider refuses to unlock.
    pub fn owner_cipher(&self, owner: &str) -> IndexCipher {
        let mut owners = self.owners.lock().unwrap();
        let key = owners
            .entry(owner.to_string())
            .or_insert_with(IndexKey::generate);
        IndexCipher::new(key)
    }

    pub fn withhold_owner(&self, owner: &str) {
        self.withheld.lock().unwrap().insert(owner.to_string());
    }

    pub fn restore_owner(&self, owner: &str) {
        self.withheld.lock().unwrap().remove(owner);
    }
}

#[async_trait]
impl KeyProvider for MockKeys {
    async fn index_key(&self) -> Result<IndexKey, CryptoError> {
        Ok(self.index.clone())
    }

    async fn owner_key(&self, owner: &str) -> Result<Option<IndexKey>, CryptoError> {
        if self.withheld.lock().unwrap().contains(owner) {
            return Ok(None);
        }
        Ok(self.owners.lock().unwrap().get(owner).cloned())
    }
}

struct FailureScript {
    remaining: u32,
    error: TransportError,
}

pub struct MockTransport {
    /// Server corpus, unsorted; queries sort newest-first on the fly.
    records: Mutex<Vec<RemoteRecord>>,
    /// Scripted event batches keyed by from-cursor. An unscripted cursor
    /// echoes itself with no mutations ("fully caught up").
    events: Mutex<HashMap<String, EventBatch>>,
    latest: Mutex<String>,
    failures: Mutex<Option<FailureScript>>,
    /// Artificial latency per call, for tests that need an operation to
    /// stay in flight while something else happens.
    delay: Mutex<Duration>,
    event_fetches: AtomicU64,
}

impl MockTransport {
    /// A transport holding `count` records: ids `r1..rN`, order `i`, time
    /// `i * 100`, each sealed under its own owner key `owner-rI`.
    pub fn with_records(keys: &MockKeys, count: u64) -> Self {
        let transport = Self {
            records: Mutex::new(Vec::new()),
            events: Mutex::new(HashMap::new()),
            latest: Mutex::new("c0".to_string()),
            failures: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            event_fetches: AtomicU64::new(0),
        };
        for i in 1..=count {
            let remote = transport.make_remote(keys, &format!("r{}", i), i, i as i64 * 100);
            transport.add_record(remote);
        }
        transport
    }

    pub fn owner_of(&self, id: &str) -> String {
        format!("owner-{}", id)
    }

    /// Build a server-side record with deterministic content derived from
    /// its ID, sealed under its owner's key.
    pub fn make_remote(&self, keys: &MockKeys, id: &str, order: u64, time: i64) -> RemoteRecord {
        let owner = self.owner_of(id);
        let content = RecordContent {
            subject: format!("subject {}", id),
            sender: "alice@example.com".into(),
            recipients: vec!["bob@example.com".into()],
            labels: vec!["inbox".into()],
            has_attachments: false,
            body: format!("needle {}", id),
        };
        let payload = keys
            .owner_cipher(&owner)
            .seal_content(&content)
            .expect("sealing test payload");
        RemoteRecord {
            id: id.to_string(),
            order,
            time,
            owner,
            payload,
        }
    }

    pub fn add_record(&self, remote: RemoteRecord) {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| r.id != remote.id);
        records.push(remote);
    }

    pub fn remove_record(&self, id: &str) {
        self.records.lock().unwrap().retain(|r| r.id != id);
    }

    pub fn set_events(&self, from_cursor: &str, batch: EventBatch) {
        self.events
            .lock()
            .unwrap()
            .insert(from_cursor.to_string(), batch);
    }

    /// The next `count` transport calls (of any kind) fail with `error`.
    pub fn fail_next(&self, count: u32, error: TransportError) {
        *self.failures.lock().unwrap() = Some(FailureScript {
            remaining: count,
            error,
        });
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn event_fetches(&self) -> u64 {
        self.event_fetches.load(Ordering::SeqCst)
    }

    async fn interpose(&self) -> Result<(), TransportError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut failures = self.failures.lock().unwrap();
        if let Some(script) = failures.as_mut() {
            if script.remaining > 0 {
                script.remaining -= 1;
                return Err(script.error.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_record_count(&self) -> Result<u64, TransportError> {
        self.interpose().await?;
        Ok(self.records.lock().unwrap().len() as u64)
    }

    async fn fetch_records_page(
        &self,
        before: Option<&BuildCursor>,
        limit: usize,
    ) -> Result<Vec<RemoteRecord>, TransportError> {
        self.interpose().await?;

        let mut page: Vec<RemoteRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| match before {
                Some(cursor) => (r.time, r.order) < (cursor.end_time, cursor.end_order),
                None => true,
            })
            .cloned()
            .collect();
        page.sort_by(|a, b| (b.time, b.order).cmp(&(a.time, a.order)));
        page.truncate(limit);
        Ok(page)
    }

    async fn fetch_single_record(&self, id: &str) -> Result<Option<RemoteRecord>, TransportError> {
        self.interpose().await?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn latest_cursor(&self) -> Result<String, TransportError> {
        self.interpose().await?;
        Ok(self.latest.lock().unwrap().clone())
    }

    async fn fetch_events_since(&self, cursor: &str) -> Result<EventBatch, TransportError> {
        self.event_fetches.fetch_add(1, Ordering::SeqCst);
        self.interpose().await?;
        let events = self.events.lock().unwrap();
        Ok(events.get(cursor).cloned().unwrap_or_else(|| EventBatch {
            cursor: cursor.to_string(),
            ..Default::default()
        }))
    }
}
