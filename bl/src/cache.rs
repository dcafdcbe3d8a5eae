//! Result cache consulted by the loader before batching
//!
//! Keys are the same strings the deduplicator uses. Values are cloned on the
//! way in and out; there is no expiry, callers evict through `delete`/`clear`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::LoaderError;

/// Asynchronous key/value store
#[async_trait]
pub trait Cache<V>: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<V>, LoaderError>;

    async fn set(&self, key: &str, value: V) -> Result<(), LoaderError>;

    async fn delete(&self, key: &str) -> Result<(), LoaderError>;

    async fn clear(&self) -> Result<(), LoaderError>;
}

/// Cache that stores nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct StubCache;

#[async_trait]
impl<V: Send + 'static> Cache<V> for StubCache {
    async fn get(&self, _key: &str) -> Result<Option<V>, LoaderError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: V) -> Result<(), LoaderError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), LoaderError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), LoaderError> {
        Ok(())
    }
}

/// In-memory cache without TTL
#[derive(Debug)]
pub struct MapCache<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> Default for MapCache<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V> MapCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl<V> Cache<V> for MapCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>, LoaderError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: V) -> Result<(), LoaderError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LoaderError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), LoaderError> {
        self.entries.write().await.clear();
        Ok(())
    }
}

/// Front for whichever cache the loader was configured with
pub struct CacheAdapter<V> {
    cache: Arc<dyn Cache<V>>,
}

impl<V> Clone for CacheAdapter<V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<V: Send + 'static> Default for CacheAdapter<V> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<V: Send + 'static> CacheAdapter<V> {
    /// Wrap `cache`, or a [`StubCache`] when none is given
    pub fn new(cache: Option<Arc<dyn Cache<V>>>) -> Self {
        let cache = cache.unwrap_or_else(|| Arc::new(StubCache) as Arc<dyn Cache<V>>);
        Self { cache }
    }

    pub async fn get(&self, key: &str) -> Result<Option<V>, LoaderError> {
        let value = self.cache.get(key).await?;
        debug!(%key, hit = value.is_some(), "CacheAdapter::get: called");
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: V) -> Result<(), LoaderError> {
        debug!(%key, "CacheAdapter::set: called");
        self.cache.set(key, value).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), LoaderError> {
        debug!(%key, "CacheAdapter::delete: called");
        self.cache.delete(key).await
    }

    pub async fn clear(&self) -> Result<(), LoaderError> {
        debug!("CacheAdapter::clear: called");
        self.cache.clear().await
    }
}
