//! TTL cache for external metadata lookups.
//!
//! Concurrent misses for one key collapse onto a per-key async gate so the
//! upstream source is hit once. A failed fetch stores nothing; the next
//! waiter through the gate makes its own attempt.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Counters for cache inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Live and not-yet-evicted entries.
    pub entries: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Upstream fetches actually made.
    pub fetches: u64,
    /// Entries dropped after expiry.
    pub evictions: u64,
}

/// Keyed TTL cache with single-flight fetches.
pub struct DiscoveryCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone + Send> DiscoveryCache<V> {
    /// An empty cache whose entries live for `default_ttl` unless overridden.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// TTL applied by [`get_or_fetch`](Self::get_or_fetch).
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Live value for `key`. Expired entries are evicted here.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    /// Store `value` for `ttl`, replacing any earlier entry.
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.lock().insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Return the cached value for `key`, or run `fetch` once and store its
    /// result for `ttl` (the default TTL when `None`).
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Discovery cache hit");
            return Ok(value);
        }

        let gate = self
            .in_flight
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = gate.lock().await;
            // another caller may have filled the entry while we waited
            if let Some(value) = self.get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Discovery cache hit after wait");
                Ok(value)
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.fetches.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Discovery cache miss, fetching");
                let fetched = fetch().await;
                if let Ok(value) = &fetched {
                    self.insert(key, value.clone(), ttl.unwrap_or(self.default_ttl));
                }
                fetched
            }
        };

        let mut in_flight = self.in_flight.lock();
        // the map plus our clone: nobody else is queued on this gate
        if in_flight
            .get(key)
            .is_some_and(|g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) <= 2)
        {
            in_flight.remove(key);
        }
        result
    }

    /// Drop one key. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
