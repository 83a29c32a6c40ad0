//! Key/value cache with TTL.
//!
//! Used for API-key lookups, RBAC decisions and role lookups. Callers
//! treat every cache error as a miss and fall through to the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nimbus_state::Timestamp;

use crate::backend::BackendResult;
use crate::clock::Clock;

/// Default TTL for cached lookups.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> BackendResult<()>;
    async fn del(&self, key: &str) -> BackendResult<()>;
    /// Delete every key starting with `prefix`.
    async fn del_prefix(&self, prefix: &str) -> BackendResult<()>;
}

/// In-process cache. Entries expire lazily on read.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Timestamp)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live and expired entries currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> BackendResult<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let expires_at = self.clock.now() + ttl;
        self.entries
            .lock()
            .expect("cache lock")
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> BackendResult<()> {
        self.entries.lock().expect("cache lock").remove(key);
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> BackendResult<()> {
        self.entries
            .lock()
            .expect("cache lock")
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn cache() -> (Arc<ManualClock>, MemoryCache) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let cache = MemoryCache::new(clock.clone());
        (clock, cache)
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let (clock, cache) = cache();
        cache.set("k", "v".into(), Duration::from_secs(300)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(301));
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn del_prefix_only_touches_matching_keys() {
        let (_, cache) = cache();
        cache.set("rbac:perm:a", "1".into(), DEFAULT_TTL).await.unwrap();
        cache.set("rbac:perm:b", "0".into(), DEFAULT_TTL).await.unwrap();
        cache.set("rbac:role:x", "{}".into(), DEFAULT_TTL).await.unwrap();

        cache.del_prefix("rbac:perm:").await.unwrap();
        assert_eq!(cache.get("rbac:perm:a").await.unwrap(), None);
        assert_eq!(cache.get("rbac:role:x").await.unwrap().as_deref(), Some("{}"));
    }
}
