//! batchloader - request coalescing and batching engine
//!
//! Individual `load(query)` calls are collapsed by key, answered from a cache
//! when possible, and otherwise grouped into batch calls of a user-supplied
//! function. Every stage runs under explicit deadlines and can be cancelled.
//!
//! # Modules
//!
//! - [`timekeeper`] - task scheduling with delays, timeouts and an optional concurrency limit
//! - [`deduplicator`] - one execution per key, shared by every concurrent caller
//! - [`aggregator`] - groups requests into batch calls
//! - [`cache`] - cache trait and the bundled implementations
//! - [`loader`] - the `BatchLoader` pipeline and its configuration
//! - [`metrics`] - in-process counters for both metrics sinks
//! - [`error`] - error taxonomy shared by every component
//! - [`cli`] - command-line interface of the `bl` demo

pub mod aggregator;
pub mod cache;
pub mod cli;
pub mod deduplicator;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod signal;
pub mod timekeeper;

mod timer;

pub use aggregator::{AggregatorConfig, BatchAggregator, BatchFn, BatchMetrics};
pub use cache::{Cache, CacheAdapter, MapCache, StubCache};
pub use deduplicator::{DedupRunner, Deduplicator, DeduplicatorConfig, KeyFn};
pub use error::{AbortKind, LoaderError};
pub use loader::{BatchLoader, BatchLoaderBuilder, LoaderConfig};
pub use metrics::{LoaderStats, StatsSnapshot};
pub use signal::AbortSignal;
pub use timekeeper::{
    BoundedTimekeeper, LimitedConfig, Scheduler, TaskHandle, TaskId, TaskStatus, Timekeeper, TimekeeperConfig,
    UnboundedTimekeeper,
};
