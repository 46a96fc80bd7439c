use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{CoverImage, Event, Table};
use crate::observability::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

pub const TABLES_KEY: &str = "tables";
pub const COVER_IMAGES_KEY: &str = "cover_images";

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Display-only list cache. Entries live until evicted or, when a TTL is set, until
/// they age out. Availability decisions never read from here.
pub struct TtlCache<V> {
    name: &'static str,
    entries: DashMap<String, Entry<V>>,
    ttl: Option<Duration>,
    enabled: bool,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(name: &'static str, ttl: Option<Duration>, enabled: bool) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            ttl,
            enabled,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }
        let expired = {
            let entry = self.entries.get(key)?;
            match self.ttl {
                Some(ttl) if entry.stored_at.elapsed() >= ttl => true,
                _ => return Some(entry.value.clone()),
            }
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    pub fn set(&self, key: &str, value: V) {
        if !self.enabled {
            return;
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn evict(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            debug!(cache = self.name, key, "evicted");
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serve `key` from the cache, or run `load` and remember its result.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(v) = self.get(key) {
            metrics::counter!(CACHE_HITS_TOTAL, "cache" => self.name).increment(1);
            return Ok(v);
        }
        metrics::counter!(CACHE_MISSES_TOTAL, "cache" => self.name).increment(1);
        let value = load().await?;
        self.set(key, value.clone());
        Ok(value)
    }
}

/// The cached lists the public site serves.
#[derive(Clone)]
pub struct ListCaches {
    pub tables: Arc<TtlCache<Vec<Table>>>,
    pub cover_images: Arc<TtlCache<Vec<CoverImage>>>,
}

impl ListCaches {
    pub fn new(ttl: Option<Duration>, enabled: bool) -> Self {
        Self {
            tables: Arc::new(TtlCache::new(TABLES_KEY, ttl, enabled)),
            cover_images: Arc::new(TtlCache::new(COVER_IMAGES_KEY, ttl, enabled)),
        }
    }

    pub fn invalidate_for(&self, event: &Event) {
        if event.touches_tables() {
            self.tables.evict(TABLES_KEY);
        }
        if event.touches_cover_images() {
            self.cover_images.evict(COVER_IMAGES_KEY);
        }
    }

    pub fn clear(&self) {
        self.tables.clear();
        self.cover_images.clear();
    }
}

/// Evict cached lists as committed events arrive. A lagging receiver may have missed
/// an invalidation, so everything is dropped in that case.
pub async fn run_invalidator(
    mut rx: broadcast::Receiver<Event>,
    caches: ListCaches,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            r = rx.recv() => r,
        };
        match received {
            Ok(event) => caches.invalidate_for(&event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "cache invalidator lagged, clearing all lists");
                caches.clear();
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::BookingFeed;
    use ulid::Ulid;

    fn table(number: u32) -> Table {
        Table {
            id: Ulid::new(),
            number,
            capacity: 4,
        }
    }

    #[test]
    fn set_then_get() {
        let cache = TtlCache::new("t", None, true);
        assert_eq!(cache.get("k"), None::<u32>);
        cache.set("k", 7u32);
        assert_eq!(cache.get("k"), Some(7));
        cache.evict("k");
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = TtlCache::new("t", None, false);
        cache.set("k", 1u32);
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let cache = TtlCache::new("t", Some(Duration::ZERO), true);
        cache.set("k", 1u32);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn get_or_load_loads_once() {
        let cache = TtlCache::new("t", None, true);
        let first: Result<u32, ()> = cache.get_or_load("k", || async { Ok(1) }).await;
        let second: Result<u32, ()> = cache.get_or_load("k", || async { Ok(2) }).await;
        assert_eq!(first, Ok(1));
        assert_eq!(second, Ok(1));
    }

    #[tokio::test]
    async fn failed_load_is_not_cached() {
        let cache = TtlCache::new("t", None, true);
        let err: Result<u32, &str> = cache.get_or_load("k", || async { Err("down") }).await;
        assert_eq!(err, Err("down"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidator_evicts_on_table_change() {
        let caches = ListCaches::new(None, true);
        caches.tables.set(TABLES_KEY, vec![table(1)]);
        caches.cover_images.set(COVER_IMAGES_KEY, vec![]);

        let feed = BookingFeed::new();
        let rx = feed.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_invalidator(rx, caches.clone(), shutdown.clone()));

        feed.send(&Event::TableCreated { table: table(2) });
        for _ in 0..50 {
            if caches.tables.get(TABLES_KEY).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(caches.tables.get(TABLES_KEY).is_none());
        assert!(caches.cover_images.get(COVER_IMAGES_KEY).is_some());

        shutdown.cancel();
        task.await.unwrap();
    }
}
