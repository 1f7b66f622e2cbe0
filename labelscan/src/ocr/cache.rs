use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use super::result::OcrResult;

/// SHA-256 hex digest of the raw image bytes, used as the cache key.
pub fn content_key(image: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image);
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    value: String,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }
}

enum Lookup {
    Absent,
    Expired,
    Found(serde_json::Result<OcrResult>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Thread-safe, content-addressed result cache with per-entry TTL.
///
/// Values are stored serialized and handed back as fresh `OcrResult`s, so
/// the cache never shares or alters what a backend produced. Expired
/// entries are dropped on read and by `purge_expired`.
///
/// The cache is bounded: once `capacity` keys are held, a `put` of a new key
/// evicts the least recently used entry even if its TTL has not elapsed.
/// A stored result is therefore returned until its TTL elapses only while
/// fewer than `capacity` newer keys have been written or read since. Time
/// alone never evicts a live entry.
#[derive(Clone)]
pub struct ContentCache {
    entries: Arc<Mutex<LruCache<String, CacheEntry>>>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ContentCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<OcrResult> {
        let now = Instant::now();
        let lookup = {
            let mut entries = self.lock();
            let lookup = match entries.get(key) {
                None => Lookup::Absent,
                Some(entry) if entry.is_expired(now) => Lookup::Expired,
                Some(entry) => Lookup::Found(serde_json::from_str::<OcrResult>(&entry.value)),
            };
            if matches!(lookup, Lookup::Expired | Lookup::Found(Err(_))) {
                entries.pop(key);
            }
            lookup
        };

        match lookup {
            Lookup::Found(Ok(result)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(result)
            }
            Lookup::Found(Err(e)) => {
                warn!(key = %key, error = %e, "Dropping undecodable cache entry");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Lookup::Absent | Lookup::Expired => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result under `key`. Evicts the least recently used entry
    /// when the cache is full.
    pub fn put(&self, key: impl Into<String>, result: &OcrResult, ttl: Duration) {
        let value = match serde_json::to_string(result) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to serialize OCR result for cache");
                return;
            }
        };

        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
            ttl,
        };
        self.lock().put(key.into(), entry);
    }

    /// Remove every expired entry and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
