//! Deduplicator - collapses concurrent identical-key calls into one execution
//!
//! The first `call` for a key starts the runner; later calls with the same key
//! join its outcome until it settles. Each execution carries its own timeout
//! and abort signal, and is removed from the registry exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{LoaderError, catch_panic};
use crate::signal::AbortSignal;
use crate::timer::{OwnerRef, lock, spawn_timer};

/// Derives the deduplication key from a query
pub type KeyFn<Q> = Arc<dyn Fn(&Q) -> String + Send + Sync>;

/// Work executed once per key
#[async_trait]
pub trait DedupRunner<Q, R>: Send + Sync {
    async fn run(&self, query: Q, signal: AbortSignal) -> Result<R, LoaderError>;
}

#[async_trait]
impl<Q, R, F, Fut> DedupRunner<Q, R> for F
where
    Q: Send + 'static,
    R: Send + 'static,
    F: Fn(Q, AbortSignal) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, LoaderError>> + Send + 'static,
{
    async fn run(&self, query: Q, signal: AbortSignal) -> Result<R, LoaderError> {
        (self)(query, signal).await
    }
}

/// Deduplicator configuration
#[derive(Debug, Clone)]
pub struct DeduplicatorConfig {
    /// Deadline for one execution, restartable via `restart_timeout`
    pub timeout_ms: u64,

    /// Timers do not keep the deduplicator alive
    pub unref_timeouts: bool,
}

impl Default for DeduplicatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            unref_timeouts: false,
        }
    }
}

impl DeduplicatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

type Outcome<R> = Option<Result<R, LoaderError>>;

struct Execution<R> {
    generation: u64,
    outcome: watch::Sender<Outcome<R>>,
    signal: AbortSignal,
    timer: Option<JoinHandle<()>>,
}

impl<R> Execution<R> {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner<Q, R> {
    config: DeduplicatorConfig,
    get_key: KeyFn<Q>,
    runner: Arc<dyn DedupRunner<Q, R>>,
    executions: Mutex<HashMap<String, Execution<R>>>,
    generation: AtomicU64,
}

/// Keyed registry of in-flight executions
pub struct Deduplicator<Q, R> {
    inner: Arc<Inner<Q, R>>,
}

impl<Q, R> Clone for Deduplicator<Q, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q, R> Deduplicator<Q, R>
where
    Q: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn new<K, F>(config: DeduplicatorConfig, get_key: K, runner: F) -> Self
    where
        K: Fn(&Q) -> String + Send + Sync + 'static,
        F: DedupRunner<Q, R> + 'static,
    {
        Self::with_key_fn(config, Arc::new(get_key), runner)
    }

    pub fn with_key_fn<F>(config: DeduplicatorConfig, get_key: KeyFn<Q>, runner: F) -> Self
    where
        F: DedupRunner<Q, R> + 'static,
    {
        debug!(?config, "Deduplicator::new: called");
        Self {
            inner: Arc::new(Inner {
                config,
                get_key,
                runner: Arc::new(runner),
                executions: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Run `query`, or join the execution already in flight for its key
    pub async fn call(&self, query: Q) -> Result<R, LoaderError> {
        let key = (self.inner.get_key)(&query);
        let mut rx = {
            let mut executions = lock(&self.inner.executions);
            match executions.get(&key) {
                Some(execution) => {
                    debug!(%key, "Deduplicator::call: joining execution in flight");
                    execution.outcome.subscribe()
                }
                None => self.inner.start(&mut executions, key.clone(), query),
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(LoaderError::silent_abort("deduplicator")))
    }

    /// Re-arm the timeout of the execution for `query`'s key, starting now
    pub fn restart_timeout(&self, query: &Q) {
        let key = (self.inner.get_key)(query);
        let mut executions = lock(&self.inner.executions);
        match executions.get_mut(&key) {
            Some(execution) => {
                debug!(%key, "Deduplicator::restart_timeout: re-arming");
                execution.disarm();
                execution.timer = Some(self.inner.arm_timeout(key.clone(), execution.generation));
            }
            None => debug!(%key, "Deduplicator::restart_timeout: nothing in flight"),
        }
    }

    /// Abort every execution in flight; all joined callers get a silent abort
    pub fn clear(&self) {
        let drained: Vec<_> = lock(&self.inner.executions).drain().collect();
        debug!(count = drained.len(), "Deduplicator::clear: aborting executions");
        for (key, mut execution) in drained {
            let err = LoaderError::silent_abort("deduplicator");
            debug!(%key, "Deduplicator::clear: aborting");
            execution.disarm();
            execution.outcome.send_replace(Some(Err(err.clone())));
            execution.signal.abort(err);
        }
    }

    /// Number of executions in flight
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.executions).len()
    }

    pub fn is_in_flight(&self, query: &Q) -> bool {
        let key = (self.inner.get_key)(query);
        lock(&self.inner.executions).contains_key(&key)
    }

    pub fn key_of(&self, query: &Q) -> String {
        (self.inner.get_key)(query)
    }
}

impl<Q, R> Inner<Q, R>
where
    Q: Send + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn start(
        self: &Arc<Self>,
        executions: &mut HashMap<String, Execution<R>>,
        key: String,
        query: Q,
    ) -> watch::Receiver<Outcome<R>> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        debug!(%key, generation, "Deduplicator::start: new execution");

        let (outcome, rx) = watch::channel(None);
        let signal = AbortSignal::new();
        executions.insert(
            key.clone(),
            Execution {
                generation,
                outcome,
                signal: signal.clone(),
                timer: Some(self.arm_timeout(key.clone(), generation)),
            },
        );

        let runner = Arc::clone(&self.runner);
        let owner = OwnerRef::new(self, self.config.unref_timeouts);
        tokio::spawn(async move {
            let result = catch_panic(runner.run(query, signal)).await;
            if let Some(inner) = owner.upgrade() {
                let reason = match &result {
                    Ok(_) => None,
                    Err(err) => {
                        debug!(%key, %err, "Deduplicator: runner terminated with an error");
                        Some(LoaderError::rejected_cascade("deduplicator"))
                    }
                };
                inner.settle(&key, generation, result, reason);
            }
        });
        rx
    }

    fn arm_timeout(self: &Arc<Self>, key: String, generation: u64) -> JoinHandle<()> {
        let timeout_ms = self.config.timeout_ms;
        spawn_timer(
            self,
            self.config.unref_timeouts,
            self.config.timeout(),
            move |inner: &Arc<Self>| {
                warn!(%key, timeout_ms, "Deduplicator: execution timed out");
                let err = LoaderError::timeout(timeout_ms);
                inner.settle(&key, generation, Err(err.clone()), Some(err));
            },
        )
    }

    /// Remove the execution, publish its outcome and, on failure, abort its signal
    fn settle(&self, key: &str, generation: u64, result: Result<R, LoaderError>, signal_reason: Option<LoaderError>) {
        let execution = {
            let mut executions = lock(&self.executions);
            match executions.get(key) {
                Some(execution) if execution.generation == generation => executions.remove(key),
                _ => None,
            }
        };
        let Some(mut execution) = execution else {
            debug!(%key, generation, "Deduplicator::settle: already settled");
            return;
        };

        execution.disarm();
        execution.outcome.send_replace(Some(result));
        if let Some(reason) = signal_reason {
            execution.signal.abort(reason);
        }
    }
}
