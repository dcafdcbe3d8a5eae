//! In-process recording of timekeeper and batch events

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::aggregator::BatchMetrics;
use crate::error::LoaderError;
use crate::timekeeper::{TaskHandle, TimekeeperMetrics};

/// Counters fed by both metrics sinks
///
/// One instance can be attached to any number of timekeepers and
/// aggregators; every counter is a relaxed atomic.
#[derive(Debug, Default)]
pub struct LoaderStats {
    tasks_created: AtomicU64,
    forced_runs: AtomicU64,
    tasks_aborted: AtomicU64,
    tasks_run: AtomicU64,
    tasks_resolved: AtomicU64,
    tasks_rejected: AtomicU64,
    peak_running: AtomicUsize,
    peak_waiting: AtomicUsize,

    items_loaded: AtomicU64,
    batches_run: AtomicU64,
    batches_resolved: AtomicU64,
    batches_rejected: AtomicU64,
    items_resolved: AtomicU64,
    items_rejected: AtomicU64,
    peak_parallel_batches: AtomicUsize,
    peak_waiting_batches: AtomicUsize,
}

/// Point-in-time copy of [`LoaderStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatsSnapshot {
    pub tasks_created: u64,
    pub forced_runs: u64,
    pub tasks_aborted: u64,
    pub tasks_run: u64,
    pub tasks_resolved: u64,
    pub tasks_rejected: u64,
    pub peak_running: usize,
    pub peak_waiting: usize,
    pub items_loaded: u64,
    pub batches_run: u64,
    pub batches_resolved: u64,
    pub batches_rejected: u64,
    pub items_resolved: u64,
    pub items_rejected: u64,
    pub peak_parallel_batches: usize,
    pub peak_waiting_batches: usize,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn add(counter: &AtomicU64, amount: usize) {
    counter.fetch_add(amount as u64, Ordering::Relaxed);
}

fn peak(gauge: &AtomicUsize, value: usize) {
    gauge.fetch_max(value, Ordering::Relaxed);
}

impl LoaderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let gauge = |gauge: &AtomicUsize| gauge.load(Ordering::Relaxed);
        StatsSnapshot {
            tasks_created: get(&self.tasks_created),
            forced_runs: get(&self.forced_runs),
            tasks_aborted: get(&self.tasks_aborted),
            tasks_run: get(&self.tasks_run),
            tasks_resolved: get(&self.tasks_resolved),
            tasks_rejected: get(&self.tasks_rejected),
            peak_running: gauge(&self.peak_running),
            peak_waiting: gauge(&self.peak_waiting),
            items_loaded: get(&self.items_loaded),
            batches_run: get(&self.batches_run),
            batches_resolved: get(&self.batches_resolved),
            batches_rejected: get(&self.batches_rejected),
            items_resolved: get(&self.items_resolved),
            items_rejected: get(&self.items_rejected),
            peak_parallel_batches: gauge(&self.peak_parallel_batches),
            peak_waiting_batches: gauge(&self.peak_waiting_batches),
        }
    }
}

impl<D> TimekeeperMetrics<D> for LoaderStats {
    fn create(&self) {
        bump(&self.tasks_created);
    }

    fn forced_run(&self) {
        bump(&self.forced_runs);
    }

    fn abort(&self, _task: &TaskHandle<D>, _error: &LoaderError) {
        bump(&self.tasks_aborted);
    }

    fn run_task(&self, running: usize, _task: &TaskHandle<D>) {
        bump(&self.tasks_run);
        peak(&self.peak_running, running);
    }

    fn resolve_task(&self, _task: &TaskHandle<D>) {
        bump(&self.tasks_resolved);
    }

    fn reject_task(&self, _error: &LoaderError, _task: &TaskHandle<D>) {
        bump(&self.tasks_rejected);
    }

    fn wait_task(&self, waiting: usize) {
        peak(&self.peak_waiting, waiting);
    }
}

impl BatchMetrics for LoaderStats {
    fn load_batch_item(&self) {
        bump(&self.items_loaded);
    }

    fn run_batch(&self, _size: usize) {
        bump(&self.batches_run);
    }

    fn resolve_batch(&self, size: usize) {
        bump(&self.batches_resolved);
        add(&self.items_resolved, size);
    }

    fn reject_batch(&self, size: usize) {
        bump(&self.batches_rejected);
        add(&self.items_rejected, size);
    }

    fn parallel_batches(&self, running: usize) {
        peak(&self.peak_parallel_batches, running);
    }

    fn waiting_batches(&self, waiting: usize) {
        peak(&self.peak_waiting_batches, waiting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::AbortSignal;
    use crate::timekeeper::{Scheduler, Timekeeper, TimekeeperConfig};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timekeeper_events_are_counted() {
        let stats = Arc::new(LoaderStats::new());
        let tk = Timekeeper::unbounded(
            TimekeeperConfig {
                run_ms: 10,
                ..Default::default()
            },
            || (),
            |_task: TaskHandle<()>, _signal: AbortSignal| async { Ok::<(), LoaderError>(()) },
        )
        .with_metrics(stats.clone());

        let first = tk.current();
        tk.wait(&first).await.unwrap();

        let second = tk.current();
        tk.run();
        tk.wait(&second).await.unwrap();

        let third = tk.current();
        tk.abort(third.id(), None);
        assert!(tk.wait(&third).await.is_err());

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.tasks_created, 3);
        assert_eq!(snapshot.forced_runs, 1);
        assert_eq!(snapshot.tasks_run, 2);
        assert_eq!(snapshot.tasks_resolved, 2);
        assert_eq!(snapshot.tasks_aborted, 1);
        assert_eq!(snapshot.tasks_rejected, 1);
        assert_eq!(snapshot.peak_running, 1);
    }

    #[test]
    fn test_batch_events_are_counted() {
        let stats = LoaderStats::new();
        stats.load_batch_item();
        stats.load_batch_item();
        stats.run_batch(2);
        stats.resolve_batch(2);
        stats.reject_batch(3);
        stats.parallel_batches(4);
        stats.parallel_batches(1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.items_loaded, 2);
        assert_eq!(snapshot.batches_run, 1);
        assert_eq!(snapshot.items_resolved, 2);
        assert_eq!(snapshot.items_rejected, 3);
        assert_eq!(snapshot.peak_parallel_batches, 4);
    }

    #[test]
    fn test_snapshot_serializes_kebab_case() {
        let stats = LoaderStats::new();
        stats.load_batch_item();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["items-loaded"], 1);
        assert_eq!(json["peak-parallel-batches"], 0);
    }
}
