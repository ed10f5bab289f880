//! Short-lived cache for expensive per-user aggregate reads.
//!
//! # Caching Strategy
//!
//! - **One entry per user**: keyed by user id, holding the last computed value
//!   and the instant it was written.
//! - **Lazy expiry**: a read is a hit only while `now - written_at < ttl`.
//!   There is no eviction task; expired entries are dropped when read, and
//!   all of them at once by the first write after each TTL.
//! - **Invalidation**: writers that change a user's usage or plan call
//!   [`ResponseCache::invalidate`]. A load that started before an
//!   invalidation does not store its (possibly stale) result.
//! - **Lifecycle**: `new`, `invalidate`, `close`. A closed cache never
//!   stores or returns entries.
//!
//! ```toml
//! [response_cache]
//! enabled = true
//! ttl_secs = 30
//! ```

use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{config::ResponseCacheConfig, observability::metrics};

struct CacheEntry<V> {
    value: V,
    written_at: Instant,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Keys with a load in progress. A key leaves when its last load ends,
    /// so this holds at most one slot per concurrent reader.
    loads: HashMap<String, PendingLoads>,
    last_purge: Instant,
}

#[derive(Default)]
struct PendingLoads {
    count: usize,
    /// Bumped by every invalidation while a load is pending.
    generation: u64,
}

impl<V> CacheState<V> {
    /// Insert an entry, first dropping expired ones if a TTL has passed
    /// since the last purge.
    fn store(&mut self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        if now.duration_since(self.last_purge) >= ttl {
            self.entries
                .retain(|_, entry| now.duration_since(entry.written_at) < ttl);
            self.last_purge = now;
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                written_at: now,
            },
        );
    }
}

/// Releases a key's pending-load slot, also when the load fails or is
/// dropped mid-flight.
struct PendingLoad<'a, V> {
    state: &'a Mutex<CacheState<V>>,
    key: &'a str,
}

impl<V> Drop for PendingLoad<'_, V> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let finished = match state.loads.get_mut(self.key) {
            Some(pending) => {
                pending.count = pending.count.saturating_sub(1);
                pending.count == 0
            }
            None => false,
        };
        if finished {
            state.loads.remove(self.key);
        }
    }
}

pub struct ResponseCache<V> {
    enabled: bool,
    ttl: Duration,
    state: Mutex<CacheState<V>>,
    closed: AtomicBool,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(config: &ResponseCacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl: config.ttl(),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                loads: HashMap::new(),
                last_purge: Instant::now(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn is_active(&self) -> bool {
        self.enabled && !self.closed.load(Ordering::Acquire)
    }

    /// Cached value for `key` if it is younger than the TTL.
    pub fn get(&self, key: &str) -> Option<V> {
        if !self.is_active() {
            return None;
        }

        let mut state = self.state.lock();
        let fresh = state
            .entries
            .get(key)
            .map(|entry| entry.written_at.elapsed() < self.ttl);

        match fresh {
            Some(true) => {
                metrics::record_cache("hit");
                state.entries.get(key).map(|entry| entry.value.clone())
            }
            Some(false) => {
                state.entries.remove(key);
                metrics::record_cache("miss");
                None
            }
            None => {
                metrics::record_cache("miss");
                None
            }
        }
    }

    /// Store a value computed now.
    pub fn insert(&self, key: &str, value: V) {
        if !self.is_active() {
            return;
        }
        self.state.lock().store(key, value, self.ttl);
    }

    /// Return the cached value, or run `load` and cache its result.
    ///
    /// If `key` is invalidated while `load` runs, the result is returned to
    /// this caller but not cached.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let generation = {
            let mut state = self.state.lock();
            let pending = state.loads.entry(key.to_string()).or_default();
            pending.count += 1;
            pending.generation
        };
        let slot = PendingLoad {
            state: &self.state,
            key,
        };

        let value = load().await?;

        if self.is_active() {
            let mut state = self.state.lock();
            let current = state.loads.get(key).map(|pending| pending.generation);
            if current == Some(generation) {
                state.store(key, value.clone(), self.ttl);
            }
        }
        drop(slot);

        Ok(value)
    }

    /// Drop the entry for `key`. The next read recomputes it.
    pub fn invalidate(&self, key: &str) {
        let mut state = self.state.lock();
        state.entries.remove(key);
        if let Some(pending) = state.loads.get_mut(key) {
            pending.generation += 1;
        }
        metrics::record_cache("invalidate");
    }

    /// Drop every entry and stop caching.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut state = self.state.lock();
        state.entries.clear();
        state.loads.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys with a load in progress.
    pub fn pending_loads(&self) -> usize {
        self.state.lock().loads.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn cache(ttl_secs: u64) -> ResponseCache<String> {
        ResponseCache::new(&ResponseCacheConfig {
            ttl_secs,
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_within_ttl() {
        let cache = cache(30);
        cache.insert("u1", "dashboard".to_string());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get("u1").as_deref(), Some("dashboard"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("u1"), None);
        // Expired entries are dropped on read
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_load_reads_through() {
        let cache = cache(30);
        let loads = AtomicUsize::new(0);
        let counter = &loads;
        let load = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::convert::Infallible>("fresh".to_string())
        };

        assert_eq!(cache.get_or_load("u1", load).await.unwrap(), "fresh");
        assert_eq!(cache.get_or_load("u1", load).await.unwrap(), "fresh");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate("u1");
        cache.get_or_load("u1", load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_racing_invalidation_is_not_cached() {
        let cache = cache(30);
        let writer = &cache;
        let value = cache
            .get_or_load("u1", move || async move {
                // A write lands while the read is in flight
                writer.invalidate("u1");
                Ok::<_, std::convert::Infallible>("stale".to_string())
            })
            .await
            .unwrap();

        assert_eq!(value, "stale");
        assert_eq!(cache.get("u1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_errors_are_not_cached() {
        let cache = cache(30);
        let result = cache
            .get_or_load("u1", || async { Err::<String, _>("db down") })
            .await;
        assert_eq!(result, Err("db down"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_cache_stores_nothing() {
        let cache = cache(30);
        cache.insert("u1", "a".to_string());
        cache.close();

        assert!(cache.is_closed());
        assert_eq!(cache.get("u1"), None);
        cache.insert("u1", "b".to_string());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_cache_always_misses() {
        let cache: ResponseCache<String> = ResponseCache::new(&ResponseCacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.insert("u1", "a".to_string());
        assert_eq!(cache.get("u1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidations_leave_no_state_behind() {
        let cache = cache(30);
        for i in 0..1000 {
            cache.invalidate(&format!("user-{i}"));
        }
        assert_eq!(cache.pending_loads(), 0);

        let loaded = cache
            .get_or_load("u1", || async { Ok::<_, &str>("a".to_string()) })
            .await;
        assert!(loaded.is_ok());
        let failed = cache
            .get_or_load("u2", || async { Err::<String, _>("db down") })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.pending_loads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_load_releases_its_slot() {
        let cache = cache(30);
        let load = cache.get_or_load("u1", || async {
            std::future::pending::<Result<String, &str>>().await
        });
        let timed_out = tokio::time::timeout(Duration::from_secs(1), load).await;
        assert!(timed_out.is_err());
        assert_eq!(cache.pending_loads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_purged_on_write() {
        let cache = cache(30);
        for i in 0..100 {
            cache.insert(&format!("user-{i}"), "old".to_string());
        }
        assert_eq!(cache.len(), 100);

        tokio::time::advance(Duration::from_secs(30)).await;
        cache.insert("late", "new".to_string());
        assert_eq!(cache.len(), 1);
    }
}
