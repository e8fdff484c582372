// =============================================================================
// Cache Store — TTL-capable key/value engine seam
// =============================================================================
//
// Both the threshold cache and the request cache persist JSON strings with a
// time-to-live through this trait. The in-process `MemoryStore` keeps its
// deadlines on the tokio clock so paused-time tests can move TTLs forward
// without sleeping.
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CacheError;

/// A live value read from the store together with its remaining TTL.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub data: String,
    pub remaining: Duration,
}

/// TTL-capable key/value engine.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a live (unexpired) value.
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, CacheError>;

    /// Write `data` under `key`, replacing any previous value and TTL.
    async fn set(&self, key: &str, data: String, ttl: Duration) -> Result<(), CacheError>;

    /// Remove `key`. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

struct MemoryEntry {
    data: String,
    expires_at: Instant,
}

/// In-process store. Expired entries are dropped lazily on read and in bulk
/// by [`MemoryStore::purge_expired`].
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, including not-yet-purged expired ones.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.entries.write();
        let before = map.len();
        map.retain(|_, e| e.expires_at > now);
        let removed = before - map.len();
        if removed > 0 {
            debug!(removed, remaining = map.len(), "purged expired cache entries");
        }
        removed
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, CacheError> {
        let now = Instant::now();
        {
            let map = self.entries.read();
            match map.get(key) {
                None => return Ok(None),
                Some(e) if e.expires_at > now => {
                    return Ok(Some(StoredValue {
                        data: e.data.clone(),
                        remaining: e.expires_at - now,
                    }));
                }
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock before removing.
        let mut map = self.entries.write();
        if map.get(key).is_some_and(|e| e.expires_at <= now) {
            map.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, data: String, ttl: Duration) -> Result<(), CacheError> {
        let entry = MemoryEntry {
            data,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .write()
            .remove(key)
            .is_some_and(|e| e.expires_at > now))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn value_expires_after_ttl() {
        let store = MemoryStore::new();
        store
            .set("k", "v".into(), Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let live = store.get("k").await.unwrap().expect("still live");
        assert_eq!(live.data, "v");
        assert_eq!(live.remaining, Duration::from_secs(6));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_replaces_value_and_ttl() {
        let store = MemoryStore::new();
        store.set("k", "a".into(), Duration::from_secs(1)).await.unwrap();
        store.set("k", "b".into(), Duration::from_secs(30)).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        let live = store.get("k").await.unwrap().unwrap();
        assert_eq!(live.data, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_entries() {
        let store = MemoryStore::new();
        store.set("short", "1".into(), Duration::from_secs(1)).await.unwrap();
        store.set("long", "2".into(), Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_reports_live_removal() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), Duration::from_secs(60)).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
