//! BatchLoader implementation
//!
//! A `load(query)` runs through three stages: the deduplicator collapses
//! concurrent calls for the same key, the cache answers repeats, and the
//! aggregator batches whatever is left. The deduplicated execution re-arms
//! its own deadline around the batch wait so that queueing inside the
//! aggregator does not count against it twice.

use std::fmt::Display;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::debug;

use crate::aggregator::{BatchAggregator, BatchFn, BatchMetrics};
use crate::cache::{Cache, CacheAdapter};
use crate::deduplicator::{DedupRunner, Deduplicator, KeyFn};
use crate::error::LoaderError;
use crate::signal::AbortSignal;

use super::config::LoaderConfig;

struct LoaderInner<Q, R> {
    config: LoaderConfig,
    get_key: KeyFn<Q>,
    cache: CacheAdapter<R>,
    deduplicator: Deduplicator<Q, R>,
    aggregator: BatchAggregator<Q, R>,
}

/// Request coalescing front end over a batch function
///
/// Cloning yields another handle to the same pipeline.
pub struct BatchLoader<Q, R> {
    inner: Arc<LoaderInner<Q, R>>,
}

impl<Q, R> Clone for BatchLoader<Q, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`BatchLoader`]
pub struct BatchLoaderBuilder<Q, R> {
    batch_fn: Arc<dyn BatchFn<Q, R>>,
    get_key: KeyFn<Q>,
    config: LoaderConfig,
    cache: Option<Arc<dyn Cache<R>>>,
    metrics: Option<Arc<dyn BatchMetrics>>,
}

impl<Q, R> BatchLoaderBuilder<Q, R>
where
    Q: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: Arc<dyn Cache<R>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the key function used for deduplication and caching
    pub fn get_key<K>(mut self, get_key: K) -> Self
    where
        K: Fn(&Q) -> String + Send + Sync + 'static,
    {
        self.get_key = Arc::new(get_key);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn BatchMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<BatchLoader<Q, R>, LoaderError> {
        self.config.validate()?;
        debug!(config = ?self.config, cached = self.cache.is_some(), "BatchLoaderBuilder::build: called");

        let Self {
            batch_fn,
            get_key,
            config,
            cache,
            metrics,
        } = self;

        let inner = Arc::new_cyclic(|weak: &Weak<LoaderInner<Q, R>>| {
            let runner = LoadRunner { loader: weak.clone() };
            LoaderInner {
                deduplicator: Deduplicator::with_key_fn(config.deduplicator(), Arc::clone(&get_key), runner),
                aggregator: BatchAggregator::with_metrics(batch_fn, config.aggregator(), metrics),
                cache: CacheAdapter::new(cache),
                get_key,
                config,
            }
        });
        Ok(BatchLoader { inner })
    }
}

impl<Q, R> BatchLoader<Q, R>
where
    Q: Clone + Display + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Loader keyed by the query's `Display` output
    pub fn new<F>(batch_fn: F, config: LoaderConfig) -> Result<Self, LoaderError>
    where
        F: BatchFn<Q, R> + 'static,
    {
        Self::builder(batch_fn).config(config).build()
    }

    pub fn builder<F>(batch_fn: F) -> BatchLoaderBuilder<Q, R>
    where
        F: BatchFn<Q, R> + 'static,
    {
        Self::builder_with_key(batch_fn, |query: &Q| query.to_string())
    }
}

impl<Q, R> BatchLoader<Q, R>
where
    Q: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Builder for queries without a `Display` key
    pub fn builder_with_key<F, K>(batch_fn: F, get_key: K) -> BatchLoaderBuilder<Q, R>
    where
        F: BatchFn<Q, R> + 'static,
        K: Fn(&Q) -> String + Send + Sync + 'static,
    {
        BatchLoaderBuilder {
            batch_fn: Arc::new(batch_fn),
            get_key: Arc::new(get_key),
            config: LoaderConfig::default(),
            cache: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    pub fn key_of(&self, query: &Q) -> String {
        (self.inner.get_key)(query)
    }

    /// Load one query, sharing any identical call already in flight
    pub async fn load(&self, query: Q) -> Result<R, LoaderError> {
        debug!(key = %self.key_of(&query), "BatchLoader::load: called");
        self.inner.deduplicator.call(query).await
    }

    /// Load every query concurrently; results keep the input order
    pub async fn load_many<I>(&self, queries: I) -> Vec<Result<R, LoaderError>>
    where
        I: IntoIterator<Item = Q>,
    {
        let loads: Vec<_> = queries.into_iter().map(|query| self.load(query)).collect();
        debug!(count = loads.len(), "BatchLoader::load_many: called");
        futures::future::join_all(loads).await
    }

    /// Drop the cached value for `query`
    pub async fn reset_cache(&self, query: &Q) -> Result<(), LoaderError> {
        let key = self.key_of(query);
        debug!(%key, "BatchLoader::reset_cache: called");
        self.inner.cache.delete(&key).await
    }

    /// Drop every cached value
    pub async fn flush(&self) -> Result<(), LoaderError> {
        debug!("BatchLoader::flush: called");
        self.inner.cache.clear().await
    }

    /// Reject everything in flight; the loader stays usable afterwards
    pub fn clear(&self) {
        debug!("BatchLoader::clear: called");
        self.inner.deduplicator.clear();
        self.inner.aggregator.clear();
    }

    /// Deduplicated executions in flight
    pub fn in_flight(&self) -> usize {
        self.inner.deduplicator.in_flight()
    }
}

impl<Q, R> LoaderInner<Q, R>
where
    Q: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    async fn fetch(&self, query: Q, signal: AbortSignal) -> Result<R, LoaderError> {
        let key = (self.get_key)(&query);
        let cached = self.cache.get(&key).await?;
        signal.check()?;
        if let Some(value) = cached {
            debug!(%key, "BatchLoader::fetch: cache hit");
            return Ok(value);
        }

        self.deduplicator.restart_timeout(&query);
        let loaded = self.aggregator.load(query.clone()).await?;
        self.deduplicator.restart_timeout(&query);

        self.cache.set(&key, loaded.clone()).await?;
        debug!(%key, "BatchLoader::fetch: loaded");
        Ok(loaded)
    }
}

/// Deduplicated work for one key
struct LoadRunner<Q, R> {
    loader: Weak<LoaderInner<Q, R>>,
}

#[async_trait]
impl<Q, R> DedupRunner<Q, R> for LoadRunner<Q, R>
where
    Q: Clone + Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    async fn run(&self, query: Q, signal: AbortSignal) -> Result<R, LoaderError> {
        match self.loader.upgrade() {
            Some(loader) => loader.fetch(query, signal).await,
            None => Err(LoaderError::silent_abort("batch loader")),
        }
    }
}
