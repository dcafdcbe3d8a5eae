//! BatchAggregator - groups individual requests into batch calls
//!
//! Requests are appended to the open task of a timekeeper. A batch closes when
//! it reaches `max_batch_size`, when its `batch_time_ms` window elapses, or on
//! `flush()`. The batch function receives the requests in arrival order and
//! must return exactly one response per request, at the same index.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::LoaderError;
use crate::signal::AbortSignal;
use crate::timekeeper::{
    LimitedConfig, Runner, Scheduler, TaskHandle, Timekeeper, TimekeeperConfig, TimekeeperMetrics,
};

/// The user-supplied batch function
#[async_trait]
pub trait BatchFn<Q, R>: Send + Sync {
    async fn load(&self, requests: Vec<Q>, signal: AbortSignal) -> Result<Vec<R>, LoaderError>;
}

#[async_trait]
impl<Q, R, F, Fut> BatchFn<Q, R> for F
where
    Q: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<Q>, AbortSignal) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<R>, LoaderError>> + Send + 'static,
{
    async fn load(&self, requests: Vec<Q>, signal: AbortSignal) -> Result<Vec<R>, LoaderError> {
        (self)(requests, signal).await
    }
}

/// Batch-level observation hooks; all default to no-ops
pub trait BatchMetrics: Send + Sync {
    /// A request was added to a batch
    fn load_batch_item(&self) {}

    /// A batch function invocation is starting
    fn run_batch(&self, _size: usize) {}

    fn resolve_batch(&self, _size: usize) {}

    fn reject_batch(&self, _size: usize) {}

    /// Batches currently running, including the one just started
    fn parallel_batches(&self, _running: usize) {}

    /// Batches parked behind the concurrency limit
    fn waiting_batches(&self, _waiting: usize) {}
}

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Maximum batches running at once; `None` or `Some(0)` means unlimited
    pub concurrency_limit: Option<usize>,

    pub max_batch_size: usize,

    /// Collection window of an open batch
    pub batch_time_ms: u64,

    /// How long a closed batch may wait for a concurrency slot
    pub max_waiting_time_ms: u64,

    /// Deadline for one batch function invocation
    pub timeout_ms: u64,

    pub unref_timeouts: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            max_batch_size: 1000,
            batch_time_ms: 50,
            max_waiting_time_ms: 60_000,
            timeout_ms: 60_000,
            unref_timeouts: false,
        }
    }
}

impl AggregatorConfig {
    pub fn batch_time(&self) -> Duration {
        Duration::from_millis(self.batch_time_ms)
    }

    /// The concurrency limit, if one applies
    pub fn limit(&self) -> Option<usize> {
        self.concurrency_limit.filter(|limit| *limit > 0)
    }

    fn timekeeper(&self) -> TimekeeperConfig {
        TimekeeperConfig {
            run_ms: self.batch_time_ms,
            timeout_ms: self.timeout_ms,
            call_rejected_task: false,
            unref_timeouts: self.unref_timeouts,
        }
    }
}

/// Payload of one batch task
#[derive(Debug)]
pub struct BatchData<Q, R> {
    requests: Vec<Q>,
    responses: Vec<Option<R>>,
}

impl<Q, R> BatchData<Q, R> {
    fn new() -> Self {
        Self {
            requests: Vec::new(),
            responses: Vec::new(),
        }
    }

    pub fn requests(&self) -> &[Q] {
        &self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

struct BatchRunner<Q, R> {
    batch_fn: Arc<dyn BatchFn<Q, R>>,
    metrics: Option<Arc<dyn BatchMetrics>>,
}

#[async_trait]
impl<Q, R> Runner<BatchData<Q, R>> for BatchRunner<Q, R>
where
    Q: Clone + Send + 'static,
    R: Send + 'static,
{
    async fn run(&self, task: TaskHandle<BatchData<Q, R>>, signal: AbortSignal) -> Result<(), LoaderError> {
        let requests = task.with_data(|data| data.requests.clone());
        let size = requests.len();
        if let Some(metrics) = &self.metrics {
            metrics.run_batch(size);
        }
        debug!(id = %task.id(), size, "BatchRunner::run: calling batch function");

        let responses = self.batch_fn.load(requests, signal).await?;
        if responses.len() != size {
            warn!(id = %task.id(), expected = size, got = responses.len(), "BatchRunner::run: response length mismatch");
            return Err(LoaderError::Batch(format!(
                "The result of the batch function must have the same length as the request array: expected {}, got {}",
                size,
                responses.len()
            )));
        }

        task.with_data(|data| data.responses = responses.into_iter().map(Some).collect());
        Ok(())
    }
}

/// Maps timekeeper events onto batch metrics
struct BatchMetricsBridge {
    metrics: Arc<dyn BatchMetrics>,
}

impl<Q, R> TimekeeperMetrics<BatchData<Q, R>> for BatchMetricsBridge {
    fn run_task(&self, running: usize, _task: &TaskHandle<BatchData<Q, R>>) {
        self.metrics.parallel_batches(running);
    }

    fn resolve_task(&self, task: &TaskHandle<BatchData<Q, R>>) {
        self.metrics.resolve_batch(task.with_data(|data| data.len()));
    }

    fn reject_task(&self, _error: &LoaderError, task: &TaskHandle<BatchData<Q, R>>) {
        self.metrics.reject_batch(task.with_data(|data| data.len()));
    }

    fn wait_task(&self, waiting: usize) {
        self.metrics.waiting_batches(waiting);
    }
}

/// Collects requests into batches and fans the responses back out
pub struct BatchAggregator<Q, R> {
    config: AggregatorConfig,
    scheduler: Arc<dyn Scheduler<BatchData<Q, R>>>,
    metrics: Option<Arc<dyn BatchMetrics>>,
}

impl<Q, R> Clone for BatchAggregator<Q, R> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            scheduler: Arc::clone(&self.scheduler),
            metrics: self.metrics.clone(),
        }
    }
}

impl<Q, R> BatchAggregator<Q, R>
where
    Q: Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new<F>(batch_fn: F, config: AggregatorConfig) -> Self
    where
        F: BatchFn<Q, R> + 'static,
    {
        Self::with_metrics(Arc::new(batch_fn), config, None)
    }

    pub fn with_metrics(
        batch_fn: Arc<dyn BatchFn<Q, R>>,
        config: AggregatorConfig,
        metrics: Option<Arc<dyn BatchMetrics>>,
    ) -> Self {
        let runner = BatchRunner {
            batch_fn,
            metrics: metrics.clone(),
        };
        let bridge: Option<Arc<dyn TimekeeperMetrics<BatchData<Q, R>>>> = metrics.clone().map(|metrics| {
            Arc::new(BatchMetricsBridge { metrics }) as Arc<dyn TimekeeperMetrics<BatchData<Q, R>>>
        });

        let scheduler: Arc<dyn Scheduler<BatchData<Q, R>>> = match config.limit() {
            Some(concurrency_limit) => {
                let limits = LimitedConfig {
                    concurrency_limit,
                    max_waiting_time_ms: config.max_waiting_time_ms,
                };
                let mut timekeeper = Timekeeper::bounded(config.timekeeper(), limits, BatchData::new, runner);
                if let Some(bridge) = bridge {
                    timekeeper = timekeeper.with_metrics(bridge);
                }
                Arc::new(timekeeper)
            }
            None => {
                let mut timekeeper = Timekeeper::unbounded(config.timekeeper(), BatchData::new, runner);
                if let Some(bridge) = bridge {
                    timekeeper = timekeeper.with_metrics(bridge);
                }
                Arc::new(timekeeper)
            }
        };
        debug!(?config, "BatchAggregator::new: called");

        Self {
            config,
            scheduler,
            metrics,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Add `request` to the open batch and wait for its response
    pub async fn load(&self, request: Q) -> Result<R, LoaderError> {
        let (task, index) = self.enqueue(request);
        if let Some(metrics) = &self.metrics {
            metrics.load_batch_item();
        }

        self.scheduler.wait(&task).await?;
        task.with_data(|data| data.responses.get_mut(index).and_then(Option::take))
            .ok_or_else(|| LoaderError::Batch(format!("No response recorded at index {}", index)))
    }

    /// Close the open batch now instead of waiting for its window
    pub fn flush(&self) {
        debug!("BatchAggregator::flush: called");
        self.scheduler.run();
    }

    /// Reject every pending, queued and running batch
    pub fn clear(&self) {
        debug!("BatchAggregator::clear: called");
        self.scheduler.clear();
    }

    /// Batches currently inside the batch function
    pub fn running_batches(&self) -> usize {
        self.scheduler.running_count()
    }

    /// Batches waiting for a concurrency slot
    pub fn waiting_batches(&self) -> usize {
        self.scheduler.waiting().len()
    }

    fn enqueue(&self, request: Q) -> (TaskHandle<BatchData<Q, R>>, usize) {
        let max_batch_size = self.config.max_batch_size.max(1);
        let mut request = Some(request);
        loop {
            let task = self.scheduler.current();
            let appended = task.update_pending(|data| {
                if data.requests.len() >= max_batch_size {
                    return None;
                }
                data.requests.push(request.take()?);
                Some(data.requests.len())
            });

            match appended {
                Some(Some(len)) => {
                    debug!(id = %task.id(), index = len - 1, "BatchAggregator::load: request added");
                    if len >= max_batch_size {
                        debug!(id = %task.id(), size = len, "BatchAggregator::load: batch full, closing");
                        self.scheduler.close(task.id());
                    }
                    return (task, len - 1);
                }
                Some(None) => {
                    debug!(id = %task.id(), "BatchAggregator::load: open batch already full");
                    self.scheduler.close(task.id());
                }
                None => debug!(id = %task.id(), "BatchAggregator::load: batch closed underneath us, retrying"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Doubles every request and records each batch it sees
    #[derive(Clone, Default)]
    struct Doubler {
        batches: Arc<Mutex<Vec<Vec<u32>>>>,
        work_ms: u64,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Doubler {
        fn working(work_ms: u64) -> Self {
            Self {
                work_ms,
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<Vec<u32>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchFn<u32, u32> for Doubler {
        async fn load(&self, requests: Vec<u32>, _signal: AbortSignal) -> Result<Vec<u32>, LoaderError> {
            self.batches.lock().unwrap().push(requests.clone());
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.work_ms)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(requests.into_iter().map(|n| n * 2).collect())
        }
    }

    fn config(max_batch_size: usize) -> AggregatorConfig {
        AggregatorConfig {
            max_batch_size,
            ..Default::default()
        }
    }

    async fn load_all(aggregator: &BatchAggregator<u32, u32>, requests: &[u32]) -> Vec<Result<u32, LoaderError>> {
        futures::future::join_all(requests.iter().map(|n| aggregator.load(*n))).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_within_window_share_one_batch() {
        let doubler = Doubler::default();
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(doubler.clone(), config(10));

        let results = load_all(&aggregator, &[1, 2, 3]).await;

        let values: Vec<u32> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![2, 4, 6]);
        assert_eq!(doubler.batches(), vec![vec![1, 2, 3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_closes_immediately() {
        let doubler = Doubler::default();
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(doubler.clone(), config(3));
        let started = Instant::now();

        let results = load_all(&aggregator, &[1, 2, 3, 4]).await;

        let values: Vec<u32> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![2, 4, 6, 8]);
        assert_eq!(doubler.batches(), vec![vec![1, 2, 3], vec![4]]);
        // The trailing partial batch still waits out its window
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_request_starts_new_batch() {
        let doubler = Doubler::default();
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(doubler.clone(), config(10));

        assert_eq!(aggregator.load(1).await.unwrap(), 2);
        assert_eq!(aggregator.load(2).await.unwrap(), 4);
        assert_eq!(doubler.batches(), vec![vec![1], vec![2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_closes_open_batch() {
        let doubler = Doubler::default();
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(
            doubler.clone(),
            AggregatorConfig {
                batch_time_ms: 10_000,
                ..config(10)
            },
        );
        let started = Instant::now();

        let pending = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move { aggregator.load(5).await })
        };
        tokio::task::yield_now().await;
        aggregator.flush();

        assert_eq!(pending.await.unwrap().unwrap(), 10);
        assert!(started.elapsed() < Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_response_length_fails_whole_batch() {
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(
            |requests: Vec<u32>, _signal: AbortSignal| async move {
                Ok::<Vec<u32>, LoaderError>(requests.into_iter().skip(1).collect())
            },
            config(10),
        );

        let results = load_all(&aggregator, &[1, 2, 3]).await;

        for result in results {
            assert!(result.unwrap_err().is_batch());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_error_reaches_every_request() {
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(
            |_requests: Vec<u32>, _signal: AbortSignal| async move {
                Err::<Vec<u32>, _>(LoaderError::upstream("backend down"))
            },
            config(10),
        );

        let results = load_all(&aggregator, &[1, 2]).await;

        let errors: Vec<LoaderError> = results.into_iter().map(Result::unwrap_err).collect();
        assert!(errors[0].is_upstream());
        assert!(errors[0].same_upstream(&errors[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_batch_times_out() {
        let doubler = Doubler::working(500);
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(
            doubler.clone(),
            AggregatorConfig {
                timeout_ms: 100,
                ..config(10)
            },
        );

        let err = aggregator.load(1).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_caps_parallel_batches() {
        let doubler = Doubler::working(100);
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(
            doubler.clone(),
            AggregatorConfig {
                concurrency_limit: Some(2),
                ..config(1)
            },
        );

        let results = load_all(&aggregator, &[1, 2, 3, 4, 5]).await;

        assert!(results.iter().all(Result::is_ok));
        let mut batches = doubler.batches();
        batches.sort();
        assert_eq!(batches, vec![vec![1], vec![2], vec![3], vec![4], vec![5]]);
        assert_eq!(doubler.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_and_waiting_batch_counts() {
        let doubler = Doubler::working(100);
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(
            doubler.clone(),
            AggregatorConfig {
                concurrency_limit: Some(2),
                ..config(1)
            },
        );

        let loads = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move { load_all(&aggregator, &[1, 2, 3, 4, 5]).await })
        };
        assert_eq!(aggregator.config().concurrency_limit, Some(2));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(aggregator.running_batches(), 2);
        assert_eq!(aggregator.waiting_batches(), 3);

        assert!(loads.await.unwrap().iter().all(Result::is_ok));
        assert_eq!(aggregator.running_batches(), 0);
        assert_eq!(aggregator.waiting_batches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_batch_times_out_without_running() {
        let doubler = Doubler::working(1_000);
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(
            doubler.clone(),
            AggregatorConfig {
                concurrency_limit: Some(1),
                max_waiting_time_ms: 100,
                ..config(1)
            },
        );

        let results = load_all(&aggregator, &[1, 2]).await;

        assert_eq!(results[0].as_ref().unwrap(), &2);
        assert!(results[1].as_ref().unwrap_err().is_timeout());
        assert_eq!(doubler.batches(), vec![vec![1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_rejects_pending_batch() {
        let doubler = Doubler::default();
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::new(doubler.clone(), config(10));

        let pending = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move { aggregator.load(1).await })
        };
        tokio::task::yield_now().await;
        aggregator.clear();

        assert!(pending.await.unwrap().unwrap_err().is_silent_abort());
        assert!(doubler.batches().is_empty());

        // The aggregator stays usable
        assert_eq!(aggregator.load(2).await.unwrap(), 4);
    }

    #[derive(Default)]
    struct Counts {
        items: AtomicUsize,
        runs: AtomicUsize,
        resolved: AtomicUsize,
        rejected: AtomicUsize,
        peak_waiting: AtomicUsize,
    }

    impl BatchMetrics for Counts {
        fn load_batch_item(&self) {
            self.items.fetch_add(1, Ordering::SeqCst);
        }

        fn run_batch(&self, _size: usize) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn resolve_batch(&self, size: usize) {
            self.resolved.fetch_add(size, Ordering::SeqCst);
        }

        fn reject_batch(&self, size: usize) {
            self.rejected.fetch_add(size, Ordering::SeqCst);
        }

        fn waiting_batches(&self, waiting: usize) {
            self.peak_waiting.fetch_max(waiting, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_follow_batches() {
        let counts = Arc::new(Counts::default());
        let aggregator: BatchAggregator<u32, u32> = BatchAggregator::with_metrics(
            Arc::new(Doubler::working(10)),
            AggregatorConfig {
                concurrency_limit: Some(1),
                ..config(2)
            },
            Some(counts.clone() as Arc<dyn BatchMetrics>),
        );

        let results = load_all(&aggregator, &[1, 2, 3, 4, 5]).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(counts.items.load(Ordering::SeqCst), 5);
        assert_eq!(counts.runs.load(Ordering::SeqCst), 3);
        assert_eq!(counts.resolved.load(Ordering::SeqCst), 5);
        assert_eq!(counts.rejected.load(Ordering::SeqCst), 0);
        assert!(counts.peak_waiting.load(Ordering::SeqCst) >= 1);
    }
}
