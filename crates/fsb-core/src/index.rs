//! Keyword index over store content.
//!
//! The backing store has no query capability, so discoverability lives here:
//! an in-memory table keyed by reference, fed incrementally on ingestion and
//! in bulk by the re-index flow, persisted as a snapshot through the record
//! store. Counter updates are lock-free per entry; `search` may observe a
//! slightly stale count, which is fine.

use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::domain::{Reference, StoredItem};

const MIN_TOKEN_LEN: usize = 2;

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "of", "in", "on", "to", "for", "with", "at", "by", "is",
];

/// Lowercase a display name and split it into index keywords.
///
/// Tokens shorter than two characters and stopwords are dropped; the result
/// is a sorted, de-duplicated set.
pub fn normalize_keywords(name: &str) -> Vec<String> {
    let mut out: Vec<String> = name
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= MIN_TOKEN_LEN)
        .filter(|t| !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect();
    out.sort();
    out.dedup();
    out
}

struct IndexEntry {
    display_name: String,
    byte_size: u64,
    created_at: DateTime<Utc>,
    keywords: Vec<String>,
    download_count: AtomicU64,
    // Unix seconds; 0 means never accessed.
    last_accessed: AtomicI64,
}

impl IndexEntry {
    fn from_item(item: &StoredItem) -> Self {
        Self {
            display_name: item.display_name.clone(),
            byte_size: item.byte_size,
            created_at: item.created_at,
            keywords: normalize_keywords(&item.display_name),
            download_count: AtomicU64::new(0),
            last_accessed: AtomicI64::new(0),
        }
    }
}

/// One search / top-N result row.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub reference: Reference,
    pub display_name: String,
    pub byte_size: u64,
    pub download_count: u64,
    pub last_accessed: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexOutcome {
    New,
    Duplicate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReindexReport {
    pub new: usize,
    pub duplicate: usize,
}

/// Explicit scan position for bulk re-indexing: the highest reference already
/// covered. Persisted through the record store by the caller, never hidden
/// module state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexCursor(pub i64);

impl ReindexCursor {
    pub fn advance_past(&mut self, reference: Reference) {
        if reference.0 > self.0 {
            self.0 = reference.0;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    reference: Reference,
    display_name: String,
    byte_size: u64,
    created_at: DateTime<Utc>,
    download_count: u64,
    last_accessed: i64,
}

/// Serializable image of the whole index, for the record store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IndexSnapshot {
    entries: Vec<SnapshotEntry>,
}

#[derive(Default)]
pub struct IndexEngine {
    entries: DashMap<Reference, Arc<IndexEntry>>,
}

impl IndexEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register one stored item. Duplicate registration (same reference) is a
    /// no-op that keeps the existing entry and its counters.
    pub fn register(&self, item: &StoredItem) -> IndexOutcome {
        let mut outcome = IndexOutcome::Duplicate;
        self.entries.entry(item.reference).or_insert_with(|| {
            outcome = IndexOutcome::New;
            Arc::new(IndexEntry::from_item(item))
        });
        outcome
    }

    /// Bulk path over a scanned window of store history. Idempotent:
    /// re-running over an already-indexed window changes nothing.
    pub fn reindex_batch(&self, items: &[StoredItem], cursor: &mut ReindexCursor) -> ReindexReport {
        let mut report = ReindexReport::default();
        for item in items {
            match self.register(item) {
                IndexOutcome::New => report.new += 1,
                IndexOutcome::Duplicate => report.duplicate += 1,
            }
            cursor.advance_past(item.reference);
        }
        report
    }

    /// Bump the download counter for a resolved reference.
    ///
    /// Safe under concurrency: the increment is atomic, so parallel accesses
    /// to the same entry never lose counts. Returns false for unindexed
    /// references.
    pub fn record_access(&self, reference: Reference) -> bool {
        let Some(entry) = self.entries.get(&reference) else {
            return false;
        };
        entry.download_count.fetch_add(1, Ordering::Relaxed);
        entry
            .last_accessed
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        true
    }

    /// Drop an entry (store purge). Returns false when it was not indexed.
    pub fn remove(&self, reference: Reference) -> bool {
        self.entries.remove(&reference).is_some()
    }

    pub fn get(&self, reference: Reference) -> Option<SearchHit> {
        self.entries
            .get(&reference)
            .map(|entry| hit(reference, entry.value()))
    }

    /// Keyword search, best match first.
    ///
    /// A query token matches an entry keyword when either contains the other,
    /// which covers both exact/containment lookups and prefix typing. Rows
    /// are ranked by matched-token count, then download count, then recency.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let query_tokens = normalize_keywords(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, SearchHit)> = Vec::new();
        for pair in self.entries.iter() {
            let entry = pair.value();
            let score = query_tokens
                .iter()
                .filter(|q| {
                    entry
                        .keywords
                        .iter()
                        .any(|k| k.contains(q.as_str()) || q.contains(k.as_str()))
                })
                .count();
            if score == 0 {
                continue;
            }
            scored.push((score, hit(*pair.key(), entry)));
        }

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.cmp(sa)
                .then(b.download_count.cmp(&a.download_count))
                .then(b.last_accessed.cmp(&a.last_accessed))
                .then(a.reference.cmp(&b.reference))
        });
        scored.into_iter().take(limit).map(|(_, h)| h).collect()
    }

    /// The `n` most downloaded items.
    pub fn top_n(&self, n: usize) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .map(|pair| hit(*pair.key(), pair.value()))
            .collect();
        hits.sort_by(|a, b| {
            b.download_count
                .cmp(&a.download_count)
                .then(b.last_accessed.cmp(&a.last_accessed))
                .then(a.reference.cmp(&b.reference))
        });
        hits.truncate(n);
        hits
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        let entries = self
            .entries
            .iter()
            .map(|pair| {
                let e = pair.value();
                SnapshotEntry {
                    reference: *pair.key(),
                    display_name: e.display_name.clone(),
                    byte_size: e.byte_size,
                    created_at: e.created_at,
                    download_count: e.download_count.load(Ordering::Relaxed),
                    last_accessed: e.last_accessed.load(Ordering::Relaxed),
                }
            })
            .collect();
        IndexSnapshot { entries }
    }

    /// Replace the in-memory table with a persisted snapshot.
    pub fn restore(&self, snapshot: IndexSnapshot) {
        self.entries.clear();
        for s in snapshot.entries {
            let entry = IndexEntry {
                display_name: s.display_name.clone(),
                byte_size: s.byte_size,
                created_at: s.created_at,
                keywords: normalize_keywords(&s.display_name),
                download_count: AtomicU64::new(s.download_count),
                last_accessed: AtomicI64::new(s.last_accessed),
            };
            self.entries.insert(s.reference, Arc::new(entry));
        }
    }
}

fn hit(reference: Reference, entry: &IndexEntry) -> SearchHit {
    let accessed = entry.last_accessed.load(Ordering::Relaxed);
    SearchHit {
        reference,
        display_name: entry.display_name.clone(),
        byte_size: entry.byte_size,
        download_count: entry.download_count.load(Ordering::Relaxed),
        last_accessed: (accessed > 0)
            .then(|| Utc.timestamp_opt(accessed, 0).single())
            .flatten(),
    }
}
