//! Timekeeper configuration

use std::time::Duration;

/// Settings shared by both timekeeper variants
#[derive(Debug, Clone)]
pub struct TimekeeperConfig {
    /// Delay before an open task closes on its own
    pub run_ms: u64,

    /// Max time a running task may take before it is aborted
    pub timeout_ms: u64,

    /// Invoke the runner with a pre-cancelled signal when a pending task is rejected
    pub call_rejected_task: bool,

    /// Timers do not keep the timekeeper alive
    pub unref_timeouts: bool,
}

impl Default for TimekeeperConfig {
    fn default() -> Self {
        Self {
            run_ms: 50,
            timeout_ms: 60_000,
            call_rejected_task: false,
            unref_timeouts: false,
        }
    }
}

impl TimekeeperConfig {
    pub fn run_delay(&self) -> Duration {
        Duration::from_millis(self.run_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Admission limits for the bounded timekeeper
#[derive(Debug, Clone)]
pub struct LimitedConfig {
    /// Max simultaneously running tasks
    pub concurrency_limit: usize,

    /// Max time a task may sit in the waiting queue
    pub max_waiting_time_ms: u64,
}

impl Default for LimitedConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 10,
            max_waiting_time_ms: 60_000,
        }
    }
}

impl LimitedConfig {
    pub fn max_waiting(&self) -> Duration {
        Duration::from_millis(self.max_waiting_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TimekeeperConfig::default();
        assert_eq!(config.run_ms, 50);
        assert_eq!(config.timeout_ms, 60_000);
        assert!(!config.call_rejected_task);
        assert!(!config.unref_timeouts);
    }

    #[test]
    fn test_durations() {
        let config = TimekeeperConfig {
            run_ms: 120,
            timeout_ms: 3_000,
            ..Default::default()
        };
        assert_eq!(config.run_delay(), Duration::from_millis(120));
        assert_eq!(config.timeout(), Duration::from_secs(3));

        let limits = LimitedConfig {
            max_waiting_time_ms: 500,
            ..Default::default()
        };
        assert_eq!(limits.max_waiting(), Duration::from_millis(500));
    }
}
