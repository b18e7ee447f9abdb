//! Read-through cache over the durable sync watermarks.
//!
//! Watermarks only ever rise. The cache holds the last value read or
//! written per key; a miss falls back to the `sync_watermarks` table.
//! Writes go through to the table, so idle keys can be evicted at any time.

use crate::error::StorageResult;
use crate::storage::{SqliteStorage, WatermarkStore};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_types::{ChannelKey, Version};

/// Key of one device's highest acknowledged conversation version.
pub fn device_max_version_key(uid: &str, device_uuid: &str) -> String {
    format!("deviceMaxVersion:{uid}-{device_uuid}")
}

/// Key of a user's highest acknowledged conversation version.
pub fn user_max_version_key(uid: &str) -> String {
    format!("userMaxVersion:{uid}")
}

/// Key of the extra version a client surface reached in one channel.
pub fn message_extra_version_key(uid: &str, source: &str, channel: &ChannelKey) -> String {
    format!(
        "messageExtraVersion:{uid}:{source}:{}:{}",
        channel.channel_id,
        channel.channel_type.as_u8()
    )
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    version: Version,
    touched: Instant,
}

/// Cached, max-merged watermarks.
pub struct Watermarks {
    storage: Arc<SqliteStorage>,
    cache: DashMap<String, Cached>,
}

impl Watermarks {
    /// Create an empty cache over `storage`.
    pub fn new(storage: Arc<SqliteStorage>) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
        }
    }

    /// Current watermark, loading it on a cache miss.
    pub async fn get(&self, key: &str) -> StorageResult<Option<Version>> {
        if let Some(mut cached) = self.cache.get_mut(key) {
            cached.touched = Instant::now();
            return Ok(Some(cached.version));
        }
        let stored = self.storage.load_watermark(key).await?;
        if let Some(version) = stored {
            self.remember(key, version);
        }
        Ok(stored)
    }

    /// Raise the watermark to at least `version` and return the stored value.
    pub async fn raise(&self, key: &str, version: Version) -> StorageResult<Version> {
        let stored = self.storage.raise_watermark(key, version).await?;
        self.remember(key, stored);
        Ok(stored)
    }

    /// Drop the cached value so the next read goes to storage.
    pub fn invalidate(&self, key: &str) {
        self.cache.remove(key);
    }

    /// Number of cached keys.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Drop keys not read or raised within `max_idle`.
    ///
    /// Returns the number of keys dropped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, cached| cached.touched.elapsed() < max_idle);
        before.saturating_sub(self.cache.len())
    }

    fn remember(&self, key: &str, version: Version) {
        let now = Instant::now();
        self.cache
            .entry(key.to_string())
            .and_modify(|cached| {
                cached.version = cached.version.max(version);
                cached.touched = now;
            })
            .or_insert(Cached {
                version,
                touched: now,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn watermarks() -> Watermarks {
        Watermarks::new(Arc::new(SqliteStorage::in_memory().await.unwrap()))
    }

    #[test]
    fn key_formats() {
        assert_eq!(device_max_version_key("u1", "d1"), "deviceMaxVersion:u1-d1");
        assert_eq!(user_max_version_key("u1"), "userMaxVersion:u1");
        assert_eq!(
            message_extra_version_key("u1", "pc", &ChannelKey::group("g1")),
            "messageExtraVersion:u1:pc:g1:2"
        );
    }

    #[tokio::test]
    async fn raise_never_lowers() {
        let marks = watermarks().await;
        assert_eq!(marks.get("k").await.unwrap(), None);
        assert_eq!(marks.raise("k", Version::new(10)).await.unwrap(), Version::new(10));
        assert_eq!(marks.raise("k", Version::new(4)).await.unwrap(), Version::new(10));
        assert_eq!(marks.get("k").await.unwrap(), Some(Version::new(10)));
    }

    #[tokio::test]
    async fn invalidated_key_reloads_from_storage() {
        let marks = watermarks().await;
        marks.raise("k", Version::new(3)).await.unwrap();
        marks.invalidate("k");
        assert_eq!(marks.cached(), 0);
        assert_eq!(marks.get("k").await.unwrap(), Some(Version::new(3)));
        assert_eq!(marks.cached(), 1);
    }

    #[tokio::test]
    async fn idle_keys_are_evicted_and_reload() {
        let marks = watermarks().await;
        marks.raise("old", Version::new(7)).await.unwrap();
        marks.raise("new", Version::new(2)).await.unwrap();

        assert_eq!(marks.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(marks.cached(), 2);

        assert_eq!(marks.evict_idle(Duration::ZERO), 2);
        assert_eq!(marks.cached(), 0);
        assert_eq!(marks.get("old").await.unwrap(), Some(Version::new(7)));
    }
}
