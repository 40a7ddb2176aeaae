use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::persistence::CacheStore;

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process TTL cache over a concurrent map.
///
/// Multi-reader/multi-writer safe with last-writer-wins per key. Expired
/// entries are dropped lazily on access; `set_if_absent` is atomic per key
/// via the map's entry lock, which is what bounds the idempotency race.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all expired entries. Callers with long-lived caches run this on
    /// a timer; tests call it directly.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get_raw(&self, key: &str) -> Option<serde_json::Value> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    async fn set_raw(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn set_if_absent(&self, key: &str, value: serde_json::Value, ttl: Duration) -> bool {
        let mut won = false;
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            won = true;
            Entry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            }
        });
        if !won && entry.is_expired() {
            *entry = Entry {
                value,
                expires_at: Instant::now() + ttl,
            };
            won = true;
        }
        won
    }

    async fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_then_get() {
        let cache = MemoryCache::new();
        cache
            .set_raw("k", json!({"v": 1}), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get_raw("k").await, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn expired_entries_are_gone() {
        let cache = MemoryCache::new();
        cache.set_raw("k", json!(1), Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get_raw("k").await, None);
    }

    #[tokio::test]
    async fn set_if_absent_only_first_wins() {
        let cache = MemoryCache::new();
        assert!(
            cache
                .set_if_absent("k", json!(1), Duration::from_secs(60))
                .await
        );
        assert!(
            !cache
                .set_if_absent("k", json!(2), Duration::from_secs(60))
                .await
        );
        assert_eq!(cache.get_raw("k").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn set_if_absent_wins_after_expiry() {
        let cache = MemoryCache::new();
        assert!(
            cache
                .set_if_absent("k", json!(1), Duration::from_millis(10))
                .await
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            cache
                .set_if_absent("k", json!(2), Duration::from_secs(60))
                .await
        );
        assert_eq!(cache.get_raw("k").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let cache = MemoryCache::new();
        cache.set_raw("old", json!(1), Duration::from_millis(10)).await;
        cache.set_raw("new", json!(2), Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_raw("new").await, Some(json!(2)));
    }
}
