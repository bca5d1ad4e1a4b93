// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Short-lived key → value cache with expiry metadata.
//!
//! Pure TTL, no size bound: an entry is a miss once `now - stored_at > ttl`.
//! Expired entries are evicted lazily on access and proactively by
//! [`TtlCache::sweep_expired`], which [`TtlCache::spawn_sweeper`] runs on an
//! interval. The sweeper holds a `Weak` reference and exits once the cache is
//! dropped.
//!
//! # Example
//!
//! ```
//! use order_sync::TtlCache;
//! use std::time::Duration;
//!
//! let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
//! cache.set("answer", 42, None);
//! assert_eq!(cache.get("answer"), Some(42));
//! assert!(cache.has("answer"));
//!
//! let meta = cache.get_with_metadata("answer").unwrap();
//! assert!(meta.expires_at > meta.stored_at);
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored: Instant,
    stored_at: DateTime<Utc>,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored) > self.ttl
    }
}

/// A cache hit with freshness metadata for display.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<V> {
    pub value: V,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub age: Duration,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
}

/// Concurrent TTL cache keyed by string.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Value for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with_metadata(key).map(|c| c.value)
    }

    /// Like [`TtlCache::get`], also returning stored-at / expires-at / age.
    pub fn get_with_metadata(&self, key: &str) -> Option<CachedValue<V>> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache(true);
                let expires_at = chrono::Duration::from_std(entry.ttl)
                    .ok()
                    .and_then(|ttl| entry.stored_at.checked_add_signed(ttl))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                return Some(CachedValue {
                    value: entry.value.clone(),
                    stored_at: entry.stored_at,
                    expires_at,
                    age: now.saturating_duration_since(entry.stored),
                });
            }
            drop(entry); // Release read lock before removing
            self.evict_if_expired(key, now);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache(false);
        None
    }

    /// Store `value`, using the cache default when `ttl` is `None`.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored: Instant::now(),
                stored_at: Utc::now(),
                ttl: ttl.unwrap_or(self.default_ttl),
            },
        );
    }

    /// True if a fresh entry exists. Does not count as a hit or miss.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let fresh = self.entries.get(key).map(|e| !e.is_expired(now));
        match fresh {
            Some(true) => true,
            Some(false) => {
                self.evict_if_expired(key, now);
                false
            }
            None => false,
        }
    }

    /// Remove `key`. Returns true if an entry was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, remaining = self.entries.len(), "Swept expired cache entries");
        }
        crate::metrics::set_cache_entries(self.entries.len());
        removed
    }

    /// Run [`TtlCache::sweep_expired`] every `interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep_expired();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count: self.entries.len(),
        }
    }

    fn evict_if_expired(&self, key: &str, now: Instant) {
        // A concurrent set() may have refreshed the entry since we looked
        if self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}
