//! Validation result cache
//!
//! Entries are keyed by a SHA-256 of the namespace and the coordinate rounded
//! to five decimals (~1 m). Reads treat an expired entry as a miss and evict
//! it; a background task sweeps whatever reads never touch.

use crate::geo::GeoPoint;
use crate::{Result, SelectorError};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

/// Time source, swappable in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// A cached validation result plus the provider payload it came from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCacheEntry<V> {
    pub value: V,
    /// Raw provider response, kept for audit
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<V> ValidationCacheEntry<V> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Key-value store with TTL semantics
pub trait CacheStore<V>: Send + Sync {
    /// Fresh entry for the key; an expired entry is evicted and reported as a miss
    fn get(&self, key: &str) -> Option<ValidationCacheEntry<V>>;

    /// Idempotent upsert
    fn put(&self, key: &str, value: V, raw: serde_json::Value, ttl: Duration) -> Result<()>;

    /// Drop every expired entry, returning how many went
    fn evict_expired(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache key for a coordinate under a namespace (e.g. "land", "urban")
pub fn cache_key(namespace: &str, p: GeoPoint) -> String {
    let input = format!("{}:{:.5},{:.5}", namespace, p.lat, p.lng);
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// In-process cache
pub struct MemoryCache<V> {
    entries: Mutex<HashMap<String, ValidationCacheEntry<V>>>,
    clock: Arc<dyn Clock>,
    capacity: Option<usize>,
}

impl<V: Clone + Send + Sync> MemoryCache<V> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            capacity: None,
        }
    }

    /// Refuse new keys once `capacity` live entries are held
    pub fn with_capacity_limit(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

impl<V: Clone + Send + Sync> Default for MemoryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> CacheStore<V> for MemoryCache<V> {
    fn get(&self, key: &str) -> Option<ValidationCacheEntry<V>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }

    fn put(&self, key: &str, value: V, raw: serde_json::Value, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();

        if let Some(capacity) = self.capacity {
            if !entries.contains_key(key) && entries.len() >= capacity {
                entries.retain(|_, e| !e.is_expired(now));
                if entries.len() >= capacity {
                    return Err(SelectorError::CacheWrite {
                        key: key.to_string(),
                        reason: format!("cache full ({capacity} entries)"),
                    });
                }
            }
        }

        entries.insert(
            key.to_string(),
            ValidationCacheEntry {
                value,
                raw,
                created_at: now,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Per-key async locks. Concurrent misses on one key queue behind the first
/// caller, which fills the cache before the others re-check it.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held while a key is being filled; the slot is released on drop
pub struct KeyGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    _held: OwnedMutexGuard<()>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let slot = self.slots.lock().entry(key.to_string()).or_default().clone();
        let held = slot.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.to_string(),
            _held: held,
        }
    }

    /// Keys with a holder or waiters
    pub fn in_flight(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.owner.slots.lock();
        // The map and this guard are the only owners when nobody is waiting
        if slots.get(&self.key).is_some_and(|slot| Arc::strong_count(slot) <= 2) {
            slots.remove(&self.key);
        }
    }
}

/// Periodically sweep expired entries, independent of pipeline runs
pub fn spawn_eviction_task<V: 'static>(cache: Arc<dyn CacheStore<V>>, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let evicted = cache.evict_expired();
            if evicted > 0 {
                debug!(evicted, remaining = cache.len(), "evicted expired cache entries");
            }
        }
    })
}
