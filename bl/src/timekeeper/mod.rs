//! Timekeeper - task scheduling with delays, timeouts and admission control
//!
//! Both variants share one implementation; they differ only in the
//! admission strategy plugged into [`Timekeeper`].

mod config;
mod core;
mod metrics;
mod task;

pub use config::{LimitedConfig, TimekeeperConfig};
pub use self::core::{Admission, Admit, BoundedTimekeeper, Limited, Runner, Scheduler, Timekeeper, UnboundedTimekeeper, Unlimited};
pub use metrics::TimekeeperMetrics;
pub use task::{TaskHandle, TaskId, TaskStatus};
