//! BatchLoader - deduplication, caching and batching behind one `load()`

mod config;
mod core;

pub use config::LoaderConfig;
pub use self::core::{BatchLoader, BatchLoaderBuilder};
