//! bl - batchloader demo
//!
//! Runs a synthetic workload through a `BatchLoader` and prints what happened.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use eyre::{Context, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use batchloader::cli::{Cli, Command};
use batchloader::{AbortSignal, BatchLoader, LoaderConfig, LoaderError, LoaderStats};

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    // Priority: CLI --log-level > RUST_LOG > INFO
    let filter = match cli_log_level {
        Some(s) => {
            let level = match s.to_uppercase().as_str() {
                "TRACE" => tracing::Level::TRACE,
                "DEBUG" => tracing::Level::DEBUG,
                "INFO" => tracing::Level::INFO,
                "WARN" | "WARNING" => tracing::Level::WARN,
                "ERROR" => tracing::Level::ERROR,
                _ => {
                    eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                    tracing::Level::INFO
                }
            };
            EnvFilter::new(level.to_string())
        }
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| eyre::eyre!("Failed to install tracing subscriber: {}", e))?;

    debug!("Logging initialized");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = LoaderConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run {
            count,
            keys,
            delay_ms,
            fail_every,
        } => {
            debug!(count, keys, delay_ms, ?fail_every, "main: matched Run command");
            cmd_run(config, count, keys, delay_ms, fail_every).await
        }
        Command::Config => {
            debug!("main: matched Config command");
            cmd_config(&config)
        }
    }
}

/// Run the synthetic workload
async fn cmd_run(config: LoaderConfig, count: u64, keys: u64, delay_ms: u64, fail_every: Option<u64>) -> Result<()> {
    debug!(?config, "cmd_run: called");
    let stats = Arc::new(LoaderStats::new());
    let calls = Arc::new(AtomicU64::new(0));

    let batch_fn = {
        let calls = Arc::clone(&calls);
        move |requests: Vec<u64>, signal: AbortSignal| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                tokio::select! {
                    _ = signal.cancelled() => {
                        return Err(signal.reason().unwrap_or_else(|| LoaderError::manual_abort("batch cancelled")));
                    }
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
                if fail_every.is_some_and(|every| call % every == 0) {
                    return Err(LoaderError::upstream(format!("synthetic failure in batch call {}", call)));
                }
                Ok::<Vec<u64>, LoaderError>(requests.into_iter().map(|n| n * 2).collect())
            }
        }
    };

    let loader: BatchLoader<u64, u64> = BatchLoader::builder(batch_fn)
        .config(config)
        .metrics(stats.clone())
        .build()
        .context("Failed to build loader")?;

    info!(count, keys, "cmd_run: issuing loads");
    let started = Instant::now();
    let results = loader.load_many((0..count).map(|i| i % keys)).await;
    let elapsed = started.elapsed();

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    for result in &results {
        let outcome = match result {
            Ok(_) => "ok",
            Err(e) if e.is_timeout() => "timeout",
            Err(e) if e.is_abort() => "aborted",
            Err(e) if e.is_batch() => "batch-error",
            Err(e) if e.is_upstream() => "upstream-error",
            Err(_) => "other-error",
        };
        *outcomes.entry(outcome).or_default() += 1;
    }
    info!(elapsed_ms = elapsed.as_millis() as u64, batch_calls = calls.load(Ordering::SeqCst), "cmd_run: done");

    let report = serde_json::json!({
        "loads": count,
        "distinct-keys": keys,
        "batch-calls": calls.load(Ordering::SeqCst),
        "elapsed-ms": elapsed.as_millis() as u64,
        "outcomes": outcomes,
        "stats": stats.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report).context("Failed to serialize report")?);
    Ok(())
}

/// Print the effective configuration
fn cmd_config(config: &LoaderConfig) -> Result<()> {
    debug!("cmd_config: called");
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
