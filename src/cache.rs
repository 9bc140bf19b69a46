use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Default lifetime of a cached API response.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
struct CacheEntry<T> {
    data: T,
    stored_at: Instant,
}

/// Read-through response cache keyed by request signature.
///
/// An entry is served while it is younger than the TTL, so a zero TTL never
/// serves anything. Expired entries are only dropped when they are looked up again.
#[derive(Debug)]
pub struct ResponseCache<T> {
    entries: RwLock<HashMap<String, CacheEntry<T>>>,
    ttl: Duration,
}

impl<T: Clone> Default for ResponseCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        {
            let entries = self.entries.read().ok()?;
            let entry = entries.get(key)?;
            if entry.stored_at.elapsed() < self.ttl {
                debug!("Cache hit for: {}", key);
                return Some(entry.data.clone());
            }
        }

        // Stale: evict on the way out
        if let Ok(mut entries) = self.entries.write() {
            if entries
                .get(key)
                .is_some_and(|entry| entry.stored_at.elapsed() >= self.ttl)
            {
                entries.remove(key);
                debug!("Evicted stale cache entry: {}", key);
            }
        }
        None
    }

    pub fn set(&self, key: impl Into<String>, data: T) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key.into(),
                CacheEntry {
                    data,
                    stored_at: Instant::now(),
                },
            );
        }
    }

    /// Number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            let dropped = entries.len();
            entries.clear();
            debug!("Cleared {} cache entries", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::advance;

    #[test]
    fn set_then_get_returns_value() {
        let cache = ResponseCache::default();
        let value = json!({"tracks": {"items": [], "total": 0}});
        cache.set("search:love:20:0", value.clone());

        assert_eq!(cache.get("search:love:20:0"), Some(value));
        assert_eq!(cache.get("search:love:20:20"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_and_are_evicted_lazily() {
        let cache = ResponseCache::new(DEFAULT_TTL);
        cache.set("featured:US:10", 1u32);
        cache.set("featured:SE:10", 2u32);

        advance(DEFAULT_TTL - Duration::from_secs(1)).await;
        assert_eq!(cache.get("featured:US:10"), Some(1));

        advance(Duration::from_secs(1)).await;

        // Both are stale but only the one looked up is dropped.
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("featured:US:10"), None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn set_refreshes_timestamp() {
        let cache = ResponseCache::new(Duration::from_secs(300));
        cache.set("k", "a");
        advance(Duration::from_secs(200)).await;
        cache.set("k", "b");
        advance(Duration::from_secs(200)).await;

        assert_eq!(cache.get("k"), Some("b"));
        assert!(!cache.is_empty());
    }

    #[test]
    fn clear_drops_every_entry() {
        let cache = ResponseCache::default();
        cache.set("a", 1u8);
        cache.set("b", 2u8);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }
}
