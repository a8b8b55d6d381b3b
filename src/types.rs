use serde::{Deserialize, Serialize};

/// One decrypted indexed unit (a message).
///
/// The store owns the sealed form of every record; values of this type are
/// decrypted projections handed to the cache and to search callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Monotonic ordering key, disambiguates records sharing a timestamp.
    pub order: u64,
    /// Unix epoch seconds.
    pub time: i64,
    pub content: RecordContent,
}

impl Record {
    /// Newest-first sort key: records compare by time, then order.
    pub fn sort_key(&self) -> (i64, u64) {
        (self.time, self.order)
    }
}

/// The searchable payload of a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordContent {
    pub subject: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub body: String,
}

/// Progress of the initial index build. Durable, outlives a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProgress {
    pub records_done: u64,
    pub records_total: u64,
}

/// Resume point for the paged build: the oldest committed record.
/// Pages are fetched newest-first, so the next page is everything strictly
/// older than this position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildCursor {
    pub end_id: String,
    pub end_time: i64,
    pub end_order: u64,
}

/// Continuation point of a truncated on-disk search scan: the last
/// considered `(order, time)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchCursor {
    pub order: u64,
    pub time: i64,
}

/// Result sort direction. Time-descending is the default everywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    #[default]
    Desc,
    Asc,
}

/// A normalized, immutable search query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    /// Lowercased, deduplicated keywords. Empty means "match everything
    /// passing the filters".
    pub keywords: Vec<String>,
    pub label: Option<String>,
    /// Inclusive time range bounds, epoch seconds.
    pub begin: Option<i64>,
    pub end: Option<i64>,
    pub has_attachments: Option<bool>,
    pub sort: SortDir,
}

impl SearchParams {
    pub fn new<I, S>(raw_keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keywords: Vec<String> = Vec::new();
        for keyword in raw_keywords {
            let normalized = keyword.as_ref().trim().to_lowercase();
            if !normalized.is_empty() && !keywords.contains(&normalized) {
                keywords.push(normalized);
            }
        }
        Self {
            keywords,
            label: None,
            begin: None,
            end: None,
            has_attachments: None,
            sort: SortDir::default(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_time_range(mut self, begin: Option<i64>, end: Option<i64>) -> Self {
        self.begin = begin;
        self.end = end;
        self
    }

    pub fn with_attachments(mut self, has_attachments: bool) -> Self {
        self.has_attachments = Some(has_attachments);
        self
    }

    pub fn with_sort(mut self, sort: SortDir) -> Self {
        self.sort = sort;
        self
    }

    /// True when the two queries differ at most in sort direction.
    /// Enables the sort-only fast path.
    pub fn same_filters(&self, other: &SearchParams) -> bool {
        self.keywords == other.keywords
            && self.label == other.label
            && self.begin == other.begin
            && self.end == other.end
            && self.has_attachments == other.has_attachments
    }

    /// Whether the record passes filters and contains every keyword
    /// (case-insensitive substring) in any searchable field.
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(begin) = self.begin {
            if record.time < begin {
                return false;
            }
        }
        if let Some(end) = self.end {
            if record.time > end {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if !record.content.labels.iter().any(|l| l == label) {
                return false;
            }
        }
        if let Some(has_attachments) = self.has_attachments {
            if record.content.has_attachments != has_attachments {
                return false;
            }
        }
        if self.keywords.is_empty() {
            return true;
        }

        let haystack = format!(
            "{}\n{}\n{}\n{}",
            record.content.subject,
            record.content.sender,
            record.content.recipients.join("\n"),
            record.content.body
        )
        .to_lowercase();

        self.keywords.iter().all(|k| haystack.contains(k.as_str()))
    }
}
