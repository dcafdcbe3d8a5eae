//! CLI command definitions for the `bl` demo binary

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// bl - drive a synthetic workload through a BatchLoader
#[derive(Debug, Parser)]
#[command(
    name = "bl",
    about = "Drive a synthetic workload through a request-coalescing batch loader",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Issue concurrent loads and report outcomes plus loader statistics
    Run {
        /// Number of loads to issue
        #[arg(short = 'n', long, default_value_t = 100)]
        count: u64,

        /// Number of distinct keys the loads are spread over
        #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        keys: u64,

        /// Simulated latency of every batch call
        #[arg(short, long = "delay-ms", default_value_t = 20)]
        delay_ms: u64,

        /// Fail every Nth batch call
        #[arg(short, long = "fail-every", value_parser = clap::value_parser!(u64).range(1..))]
        fail_every: Option<u64>,
    },

    /// Print the effective configuration as YAML
    Config,
}
