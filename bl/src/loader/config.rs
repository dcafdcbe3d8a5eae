//! BatchLoader configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::aggregator::AggregatorConfig;
use crate::deduplicator::DeduplicatorConfig;
use crate::error::LoaderError;

/// BatchLoader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Deadline for one batch function invocation
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Timers do not keep the loader alive
    #[serde(rename = "unref-timeouts")]
    pub unref_timeouts: bool,

    /// Maximum batches in flight; unlimited when absent
    #[serde(rename = "concurrency-limit")]
    pub concurrency_limit: Option<usize>,

    /// Maximum requests per batch
    #[serde(rename = "max-batch-size")]
    pub max_batch_size: usize,

    /// Collection window for a batch
    #[serde(rename = "batch-time-ms")]
    pub batch_time_ms: u64,

    /// Maximum time a closed batch waits for a concurrency slot
    #[serde(rename = "max-waiting-time-ms")]
    pub max_waiting_time_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            unref_timeouts: false,
            concurrency_limit: None,
            max_batch_size: 1000,
            batch_time_ms: 50,
            max_waiting_time_ms: 60_000,
        }
    }
}

impl LoaderConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), LoaderError> {
        if self.max_batch_size == 0 {
            return Err(LoaderError::Config("max-batch-size must be at least 1".to_string()));
        }
        if self.concurrency_limit == Some(0) {
            return Err(LoaderError::Config(
                "concurrency-limit must be at least 1 (omit it for no limit)".to_string(),
            ));
        }
        Ok(())
    }

    /// Deduplicator settings; its deadline also covers the batch window
    pub fn deduplicator(&self) -> DeduplicatorConfig {
        DeduplicatorConfig {
            timeout_ms: self.timeout_ms.saturating_add(self.batch_time_ms),
            unref_timeouts: self.unref_timeouts,
        }
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            concurrency_limit: self.concurrency_limit,
            max_batch_size: self.max_batch_size,
            batch_time_ms: self.batch_time_ms,
            max_waiting_time_ms: self.max_waiting_time_ms,
            timeout_ms: self.timeout_ms,
            unref_timeouts: self.unref_timeouts,
        }
    }

    /// Load configuration: the explicit path if given, otherwise the first
    /// readable of `.batchloader.yml` and `<config_dir>/batchloader/batchloader.yml`,
    /// otherwise defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let mut candidates = vec![PathBuf::from(".batchloader.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("batchloader").join("batchloader.yml"));
        }
        Ok(Self::load_first(&candidates))
    }

    fn load_first(candidates: &[PathBuf]) -> Self {
        for path in candidates.iter().filter(|path| path.exists()) {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!(path = %path.display(), "Skipping config file: {:#}", e),
            }
        }
        tracing::info!("No usable config file found, using defaults");
        Self::default()
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("Invalid config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}
