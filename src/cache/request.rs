// =============================================================================
// Request Cache — read-through cache for REST lookups
// =============================================================================
//
// Wraps slow upstream fetches (ticker snapshots, kline history, depth
// snapshots) behind a TTL cache keyed by `CacheKey`. Store failures are
// bypassed: the caller always gets a fetched value when the fetch succeeds.
// Fetch failures are returned to the caller and never cached.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::keys::CacheKey;
use crate::cache::store::CacheStore;

#[derive(Debug, Clone, Serialize)]
pub struct RequestCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bypassed: u64,
}

pub struct RequestCache {
    store: Arc<dyn CacheStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    bypassed: AtomicU64,
}

impl RequestCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
        }
    }

    /// Return the cached value under `key`, or run `fetch`, cache its result
    /// for `ttl` and return it.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = key.to_string();
        let mut store_ok = true;

        match self.store.get(&key).await {
            Ok(Some(stored)) => match serde_json::from_str::<T>(&stored.data) {
                Ok(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "request cache hit");
                    return Ok(value);
                }
                Err(e) => warn!(key = %key, error = %e, "undecodable cached response, refetching"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "request cache read failed, bypassing");
                store_ok = false;
            }
        }

        if store_ok {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bypassed.fetch_add(1, Ordering::Relaxed);
        }

        let value = fetch().await?;

        if store_ok {
            match serde_json::to_string(&value) {
                Ok(encoded) => {
                    if let Err(e) = self.store.set(&key, encoded, ttl).await {
                        warn!(key = %key, error = %e, "request cache write failed");
                    }
                }
                Err(e) => warn!(key = %key, error = %e, "response not cacheable"),
            }
        }

        Ok(value)
    }

    /// Drop a cached response. Store errors are logged and reported as `false`.
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        let key = key.to_string();
        match self.store.delete(&key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = %key, error = %e, "request cache invalidate failed");
                false
            }
        }
    }

    pub fn stats(&self) -> RequestCacheStats {
        RequestCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::{MemoryStore, StoredValue};
    use crate::error::CacheError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn key() -> CacheKey {
        CacheKey::new("rest", "ticker", "BTCUSDT")
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let cache = RequestCache::new(Arc::new(MemoryStore::new()));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let v: f64 = cache
                .get_or_fetch(&key(), Duration::from_secs(10), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42.5)
                })
                .await
                .unwrap();
            assert_eq!(v, 42.5);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_response_is_refetched() {
        let cache = RequestCache::new(Arc::new(MemoryStore::new()));
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = move || async move {
            Ok::<_, anyhow::Error>(calls.fetch_add(1, Ordering::SeqCst))
        };

        assert_eq!(cache.get_or_fetch(&key(), Duration::from_secs(2), fetch).await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cache.get_or_fetch(&key(), Duration::from_secs(2), fetch).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fetch_errors_are_not_cached() {
        let cache = RequestCache::new(Arc::new(MemoryStore::new()));
        let err = cache
            .get_or_fetch::<u32, _, _>(&key(), Duration::from_secs(10), || async {
                Err(anyhow::anyhow!("418 I'm a teapot"))
            })
            .await;
        assert!(err.is_err());

        let ok: u32 = cache
            .get_or_fetch(&key(), Duration::from_secs(10), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(ok, 7);
    }

    struct DownStore;

    #[async_trait]
    impl CacheStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<StoredValue>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn set(&self, _key: &str, _data: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn unreachable_store_is_bypassed() {
        let cache = RequestCache::new(Arc::new(DownStore));
        let v: String = cache
            .get_or_fetch(&key(), Duration::from_secs(10), || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(v, "fresh");
        assert_eq!(cache.stats().bypassed, 1);
        assert!(!cache.invalidate(&key()).await);
    }
}
