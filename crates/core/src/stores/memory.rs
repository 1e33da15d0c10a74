use crate::cache::QueryCache;
use crate::error::RagError;
use crate::models::QueryOutcome;
use async_trait::async_trait;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub const DEFAULT_CACHE_CAPACITY: usize = 1_024;

#[derive(Debug, Clone)]
struct Entry {
    document_id: String,
    outcome: QueryOutcome,
    expires_at: Instant,
}

struct Entries {
    by_key: LruCache<String, Entry>,
    by_document: HashMap<String, HashSet<String>>,
}

impl Entries {
    fn forget(&mut self, document_id: &str, key: &str) {
        if let Some(keys) = self.by_document.get_mut(document_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_document.remove(document_id);
            }
        }
    }
}

/// In-process LRU cache with per-entry expiry. Holds at most `capacity` outcomes; the least
/// recently used one is evicted first and expired ones are dropped when read.
pub struct MemoryCache {
    entries: Mutex<Entries>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(Entries {
                by_key: LruCache::new(capacity),
                by_document: HashMap::new(),
            }),
        }
    }
}

#[async_trait]
impl QueryCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<QueryOutcome>, RagError> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.by_key.get(key) else {
            return Ok(None);
        };
        if entry.expires_at > Instant::now() {
            return Ok(Some(entry.outcome.clone()));
        }

        if let Some(expired) = entries.by_key.pop(key) {
            entries.forget(&expired.document_id, key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        document_id: &str,
        key: &str,
        outcome: &QueryOutcome,
        ttl: Duration,
    ) -> Result<(), RagError> {
        let mut entries = self.entries.lock().await;
        let displaced = entries.by_key.push(
            key.to_string(),
            Entry {
                document_id: document_id.to_string(),
                outcome: outcome.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        // Either the previous value under `key` or the evicted least recently used entry.
        if let Some((displaced_key, displaced)) = displaced {
            entries.forget(&displaced.document_id, &displaced_key);
        }

        entries
            .by_document
            .entry(document_id.to_string())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    async fn invalidate_document(&self, document_id: &str) -> Result<usize, RagError> {
        let mut entries = self.entries.lock().await;
        let keys = entries.by_document.remove(document_id).unwrap_or_default();
        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|key| entries.by_key.pop(key.as_str()))
            .filter(|entry| entry.expires_at > now)
            .count();
        Ok(removed)
    }
}
