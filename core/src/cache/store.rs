// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory cache store with TTL and byte-cap eviction.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Default entry lifetime
    pub ttl: Duration,
    /// Total payload byte cap
    pub max_memory_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

struct Entry {
    payload: Bytes,
    created_at: Instant,
    expires_at: Instant,
    /// Millis since store creation, updated on every hit
    last_access: AtomicU64,
    hits: AtomicU64,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

/// One logical cache store (manifests, blob descriptors, or tag lists)
pub struct CacheStore {
    name: String,
    config: StoreConfig,
    entries: RwLock<HashMap<String, Entry>>,
    epoch: Instant,
    bytes: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    /// Eviction is serialized per store
    evict_lock: Mutex<()>,
}

impl CacheStore {
    /// Create a named store
    pub fn new(name: impl Into<String>, config: StoreConfig) -> Self {
        Self {
            name: name.into(),
            config,
            entries: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
            bytes: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            evict_lock: Mutex::new(()),
        }
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Look up a live entry; expired entries count as misses
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if Instant::now() < entry.expires_at => {
                    entry.hits.fetch_add(1, Ordering::Relaxed);
                    entry
                        .last_access
                        .store(self.now_millis(), Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::cache_op(&self.name, "hit");
                    return Some(entry.payload.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write();
            if let Some(entry) = entries.get(key) {
                if Instant::now() >= entry.expires_at {
                    let size = entry.payload.len();
                    entries.remove(key);
                    self.bytes.fetch_sub(size, Ordering::AcqRel);
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::cache_op(&self.name, "miss");
        None
    }

    /// Insert or replace an entry with the store's default TTL
    pub fn put(&self, key: impl Into<String>, payload: Bytes) {
        self.put_with_ttl(key, payload, self.config.ttl)
    }

    /// Insert or replace an entry with an explicit TTL
    pub fn put_with_ttl(&self, key: impl Into<String>, payload: Bytes, ttl: Duration) {
        let key = key.into();
        let size = payload.len();
        self.ensure_capacity(size);

        let now = Instant::now();
        let entry = Entry {
            payload,
            created_at: now,
            expires_at: now + ttl,
            last_access: AtomicU64::new(self.now_millis()),
            hits: AtomicU64::new(0),
        };

        let mut entries = self.entries.write();
        if let Some(old) = entries.insert(key, entry) {
            self.bytes.fetch_sub(old.payload.len(), Ordering::AcqRel);
        }
        self.bytes.fetch_add(size, Ordering::AcqRel);
    }

    /// Remove an entry
    pub fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        if let Some(old) = entries.remove(key) {
            self.bytes.fetch_sub(old.payload.len(), Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// All live keys (used by redistribution)
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| now < e.expires_at)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Evict lowest-scoring entries until `incoming` fits under the cap.
    ///
    /// Score combines recency and frequency: stale, rarely-hit entries go
    /// first.
    fn ensure_capacity(&self, incoming: usize) {
        if self.bytes.load(Ordering::Acquire) + incoming <= self.config.max_memory_bytes {
            return;
        }
        let _guard = self.evict_lock.lock();

        while self.bytes.load(Ordering::Acquire) + incoming > self.config.max_memory_bytes {
            let victim = {
                let entries = self.entries.read();
                let now = self.now_millis();
                entries
                    .iter()
                    .map(|(key, entry)| {
                        let idle = now.saturating_sub(entry.last_access.load(Ordering::Relaxed));
                        let hits = entry.hits.load(Ordering::Relaxed);
                        let score = idle as f64 / (1.0 + hits as f64);
                        (key.clone(), score)
                    })
                    .max_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(key, _)| key)
            };
            let Some(key) = victim else { return };
            if self.delete(&key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                crate::metrics::cache_op(&self.name, "evict");
                debug!(store = %self.name, %key, "evicted cache entry");
            }
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.read().len(),
            bytes: self.bytes.load(Ordering::Acquire),
        }
    }

    /// Age of an entry, if present (used by tests and reporting)
    pub fn age(&self, key: &str) -> Option<Duration> {
        self.entries
            .read()
            .get(key)
            .map(|e| e.created_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_bytes: usize) -> CacheStore {
        CacheStore::new(
            "test",
            StoreConfig {
                ttl: Duration::from_secs(60),
                max_memory_bytes: max_bytes,
            },
        )
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let s = store(1024);
        s.put("k1", Bytes::from_static(b"hello"));

        assert_eq!(s.get("k1"), Some(Bytes::from_static(b"hello")));
        assert!(s.delete("k1"));
        assert_eq!(s.get("k1"), None);

        let stats = s.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let s = store(1024);
        s.put_with_ttl("k1", Bytes::from_static(b"v"), Duration::from_secs(5));

        assert!(s.get("k1").is_some());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(s.get("k1").is_none());
        assert_eq!(s.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_eviction_under_memory_pressure() {
        let s = store(100);
        s.put("a", Bytes::from(vec![0u8; 40]));
        s.put("b", Bytes::from(vec![0u8; 40]));

        // Touch "a" so "b" is the colder victim
        let _ = s.get("a");

        s.put("c", Bytes::from(vec![0u8; 40]));

        assert!(s.stats().bytes <= 100);
        assert!(s.stats().evictions >= 1);
        assert!(s.get("c").is_some());
    }

    #[tokio::test]
    async fn test_replace_accounts_bytes() {
        let s = store(1024);
        s.put("k", Bytes::from(vec![0u8; 100]));
        s.put("k", Bytes::from(vec![0u8; 10]));
        assert_eq!(s.stats().bytes, 10);
    }
}
