//! Timekeeper implementation
//!
//! A timekeeper holds at most one open (pending) task at a time. The open task
//! closes when its `run_ms` delay elapses or when `run()` is called, and is
//! then handed to an [`Admission`] strategy: [`Unlimited`] starts it at once,
//! [`Limited`] parks it in a FIFO waiting queue while `concurrency_limit`
//! tasks are already running.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{LoaderError, catch_panic};
use crate::signal::AbortSignal;
use crate::timer::{OwnerRef, lock, spawn_timer};

use super::config::{LimitedConfig, TimekeeperConfig};
use super::metrics::TimekeeperMetrics;
use super::task::{TaskHandle, TaskId};

/// Work executed once per closed task
#[async_trait]
pub trait Runner<D>: Send + Sync {
    async fn run(&self, task: TaskHandle<D>, signal: AbortSignal) -> Result<(), LoaderError>;
}

#[async_trait]
impl<D, F, Fut> Runner<D> for F
where
    D: Send + 'static,
    F: Fn(TaskHandle<D>, AbortSignal) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), LoaderError>> + Send + 'static,
{
    async fn run(&self, task: TaskHandle<D>, signal: AbortSignal) -> Result<(), LoaderError> {
        (self)(task, signal).await
    }
}

/// Common surface of both timekeeper variants
#[async_trait]
pub trait Scheduler<D>: Send + Sync {
    /// The open task, created on demand
    fn current(&self) -> TaskHandle<D>;

    /// Close the open task now
    fn run(&self);

    /// Close the open task, but only if it is still `id`
    fn close(&self, id: &TaskId);

    /// Reject a task wherever it is; unknown ids are ignored
    fn abort(&self, id: &TaskId, reason: Option<LoaderError>);

    /// Wait for a task to settle
    async fn wait(&self, task: &TaskHandle<D>) -> Result<(), LoaderError>;

    /// Wait for a task by id; an id the timekeeper no longer tracks is `Ok`
    async fn wait_id(&self, id: &TaskId) -> Result<(), LoaderError>;

    /// Abort every queued, open and running task
    fn clear(&self);

    fn find(&self, id: &TaskId) -> Option<TaskHandle<D>>;

    fn running_count(&self) -> usize;

    /// Tasks parked in the waiting queue, oldest first
    fn waiting(&self) -> Vec<TaskHandle<D>>;
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Now,
    Queue { max_wait: Duration },
}

/// Decides whether a closed task may start running
pub trait Admission: Send + Sync + 'static {
    fn admit(&self, running: usize) -> Admit;

    fn name(&self) -> &'static str;
}

/// Every task runs as soon as it closes
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

impl Admission for Unlimited {
    fn admit(&self, _running: usize) -> Admit {
        Admit::Now
    }

    fn name(&self) -> &'static str {
        "unlimited"
    }
}

/// At most `concurrency_limit` tasks run; the rest wait in FIFO order
#[derive(Debug, Clone)]
pub struct Limited {
    config: LimitedConfig,
}

impl Limited {
    pub fn new(config: LimitedConfig) -> Self {
        Self { config }
    }

}

impl Admission for Limited {
    fn admit(&self, running: usize) -> Admit {
        if running < self.config.concurrency_limit {
            Admit::Now
        } else {
            Admit::Queue {
                max_wait: self.config.max_waiting(),
            }
        }
    }

    fn name(&self) -> &'static str {
        "limited"
    }
}

pub type UnboundedTimekeeper<D> = Timekeeper<D, Unlimited>;
pub type BoundedTimekeeper<D> = Timekeeper<D, Limited>;

/// A task plus the scheduling state the timekeeper keeps for it
struct Slot<D> {
    task: TaskHandle<D>,
    signal: AbortSignal,
    timer: Option<JoinHandle<()>>,
}

impl<D> Slot<D> {
    fn new(task: TaskHandle<D>) -> Self {
        Self {
            task,
            signal: AbortSignal::new(),
            timer: None,
        }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct State<D> {
    current: Option<Slot<D>>,
    running: HashMap<TaskId, Slot<D>>,
    waiting: VecDeque<Slot<D>>,
}

struct Inner<D, A> {
    config: TimekeeperConfig,
    admission: A,
    factory: Box<dyn Fn() -> D + Send + Sync>,
    runner: Arc<dyn Runner<D>>,
    metrics: Option<Arc<dyn TimekeeperMetrics<D>>>,
    state: Mutex<State<D>>,
}

/// Task scheduler parameterised by its admission strategy
///
/// Cloning yields another handle to the same scheduler. All operations must
/// be called from within a tokio runtime.
pub struct Timekeeper<D, A = Unlimited> {
    inner: Arc<Inner<D, A>>,
}

impl<D, A> Clone for Timekeeper<D, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Send + 'static> Timekeeper<D, Unlimited> {
    pub fn unbounded<F, R>(config: TimekeeperConfig, factory: F, runner: R) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        R: Runner<D> + 'static,
    {
        Self::with_admission(config, Unlimited, factory, runner)
    }
}

impl<D: Send + 'static> Timekeeper<D, Limited> {
    pub fn bounded<F, R>(config: TimekeeperConfig, limits: LimitedConfig, factory: F, runner: R) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        R: Runner<D> + 'static,
    {
        Self::with_admission(config, Limited::new(limits), factory, runner)
    }
}

impl<D, A> Timekeeper<D, A>
where
    D: Send + 'static,
    A: Admission,
{
    pub fn with_admission<F, R>(config: TimekeeperConfig, admission: A, factory: F, runner: R) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        R: Runner<D> + 'static,
    {
        debug!(?config, admission = admission.name(), "Timekeeper::new: called");
        Self {
            inner: Arc::new(Inner {
                config,
                admission,
                factory: Box::new(factory),
                runner: Arc::new(runner),
                metrics: None,
                state: Mutex::new(State {
                    current: None,
                    running: HashMap::new(),
                    waiting: VecDeque::new(),
                }),
            }),
        }
    }

    /// Attach a metrics sink. Has no effect once the handle has been cloned.
    pub fn with_metrics(mut self, metrics: Arc<dyn TimekeeperMetrics<D>>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.metrics = Some(metrics),
            None => warn!("Timekeeper::with_metrics: handle already shared, metrics ignored"),
        }
        self
    }

    pub fn config(&self) -> &TimekeeperConfig {
        &self.inner.config
    }
}

impl<D, A> Inner<D, A>
where
    D: Send + 'static,
    A: Admission,
{
    fn current(self: &Arc<Self>) -> TaskHandle<D> {
        let mut state = lock(&self.state);
        if let Some(slot) = &state.current {
            return slot.task.clone();
        }

        let task = TaskHandle::new((self.factory)());
        debug!(id = %task.id(), "Timekeeper::current: created task");

        let id = task.id().clone();
        let mut slot = Slot::new(task.clone());
        slot.timer = Some(spawn_timer(
            self,
            self.config.unref_timeouts,
            self.config.run_delay(),
            move |inner: &Arc<Self>| inner.run_on_timer(&id),
        ));
        state.current = Some(slot);

        if let Some(metrics) = &self.metrics {
            metrics.create();
        }
        task
    }

    /// Close the open task; with `only`, only if it is still that task
    fn run(self: &Arc<Self>, only: Option<&TaskId>) {
        let mut state = lock(&self.state);
        let Some(mut slot) = Self::take_current(&mut state, only) else {
            debug!(?only, "Timekeeper::run: no matching open task");
            return;
        };
        slot.disarm();
        debug!(id = %slot.task.id(), "Timekeeper::run: closing task manually");
        if let Some(metrics) = &self.metrics {
            metrics.forced_run();
        }
        self.close(&mut state, slot);
    }

    fn run_on_timer(self: &Arc<Self>, id: &TaskId) {
        let mut state = lock(&self.state);
        match Self::take_current(&mut state, Some(id)) {
            Some(slot) => {
                debug!(%id, "Timekeeper::run_on_timer: closing task by timer");
                self.close(&mut state, slot);
            }
            None => debug!(%id, "Timekeeper::run_on_timer: task already closed"),
        }
    }

    fn take_current(state: &mut State<D>, only: Option<&TaskId>) -> Option<Slot<D>> {
        match (&state.current, only) {
            (Some(slot), Some(id)) if slot.task.id() != id => None,
            _ => state.current.take(),
        }
    }

    /// Hand a closed task to the admission strategy
    fn close(self: &Arc<Self>, state: &mut State<D>, mut slot: Slot<D>) {
        match self.admission.admit(state.running.len()) {
            Admit::Now => self.launch(state, slot),
            Admit::Queue { max_wait } => {
                let id = slot.task.id().clone();
                let max_wait_ms = max_wait.as_millis() as u64;
                slot.timer = Some(spawn_timer(
                    self,
                    self.config.unref_timeouts,
                    max_wait,
                    move |inner: &Arc<Self>| {
                        inner.expire_waiting(&id, LoaderError::timeout(max_wait_ms));
                    },
                ));
                debug!(id = %slot.task.id(), waiting = state.waiting.len() + 1, "Timekeeper::close: queued");
                state.waiting.push_back(slot);
                if let Some(metrics) = &self.metrics {
                    metrics.wait_task(state.waiting.len());
                }
            }
        }
    }

    fn launch(self: &Arc<Self>, state: &mut State<D>, mut slot: Slot<D>) {
        slot.disarm();
        if !slot.task.mark_running() {
            debug!(id = %slot.task.id(), "Timekeeper::launch: task no longer pending");
            return;
        }

        let id = slot.task.id().clone();
        let timeout_ms = self.config.timeout_ms;
        let timeout_id = id.clone();
        slot.timer = Some(spawn_timer(
            self,
            self.config.unref_timeouts,
            self.config.timeout(),
            move |inner: &Arc<Self>| {
                warn!(id = %timeout_id, timeout_ms, "Timekeeper: task timed out");
                inner.abort(&timeout_id, Some(LoaderError::timeout(timeout_ms)));
            },
        ));

        let task = slot.task.clone();
        let signal = slot.signal.clone();
        state.running.insert(id.clone(), slot);
        debug!(%id, running = state.running.len(), "Timekeeper::launch: running task");
        if let Some(metrics) = &self.metrics {
            metrics.run_task(state.running.len(), &task);
        }

        let runner = Arc::clone(&self.runner);
        let owner = OwnerRef::new(self, self.config.unref_timeouts);
        tokio::spawn(async move {
            let result = catch_panic(runner.run(task.clone(), signal)).await;
            match owner.upgrade() {
                Some(inner) => inner.finish(&id, result),
                None => match result {
                    Ok(()) => {
                        task.resolve();
                    }
                    Err(err) => {
                        task.reject(err);
                    }
                },
            }
        });
    }

    fn finish(self: &Arc<Self>, id: &TaskId, result: Result<(), LoaderError>) {
        let mut state = lock(&self.state);
        let Some(mut slot) = state.running.remove(id) else {
            debug!(%id, "Timekeeper::finish: late result discarded");
            return;
        };
        slot.disarm();

        match result {
            Ok(()) => {
                if slot.task.resolve() {
                    debug!(%id, "Timekeeper::finish: task resolved");
                    if let Some(metrics) = &self.metrics {
                        metrics.resolve_task(&slot.task);
                    }
                }
            }
            Err(err) => self.reject_running(&slot, err),
        }
        self.promote(&mut state);
    }

    fn reject_running(&self, slot: &Slot<D>, err: LoaderError) {
        slot.signal.abort(err.clone());
        if slot.task.reject(err.clone()) {
            debug!(id = %slot.task.id(), %err, "Timekeeper: running task rejected");
            if let Some(metrics) = &self.metrics {
                metrics.reject_task(&err, &slot.task);
            }
        }
    }

    fn reject_pending(&self, slot: Slot<D>, err: LoaderError) {
        slot.signal.abort(err.clone());
        if !slot.task.reject(err.clone()) {
            return;
        }
        debug!(id = %slot.task.id(), %err, "Timekeeper: pending task rejected");
        if let Some(metrics) = &self.metrics {
            metrics.reject_task(&err, &slot.task);
        }

        if self.config.call_rejected_task {
            let runner = Arc::clone(&self.runner);
            let Slot { task, signal, .. } = slot;
            tokio::spawn(async move {
                let id = task.id().clone();
                if let Err(err) = runner.run(task, signal).await {
                    debug!(%id, %err, "Timekeeper: aborted runner terminated with an error");
                }
            });
        }
    }

    /// Start queued tasks while the admission strategy allows it
    fn promote(self: &Arc<Self>, state: &mut State<D>) {
        while !state.waiting.is_empty() {
            if self.admission.admit(state.running.len()) != Admit::Now {
                break;
            }
            if let Some(next) = state.waiting.pop_front() {
                debug!(id = %next.task.id(), "Timekeeper::promote: starting task from waiting queue");
                self.launch(state, next);
            }
        }
    }

    fn abort(self: &Arc<Self>, id: &TaskId, reason: Option<LoaderError>) {
        let err = reason.unwrap_or_else(|| LoaderError::manual_abort("task aborted"));
        let mut state = lock(&self.state);

        if let Some(mut slot) = state.running.remove(id) {
            debug!(%id, "Timekeeper::abort: aborting running task");
            slot.disarm();
            if let Some(metrics) = &self.metrics {
                metrics.abort(&slot.task, &err);
            }
            self.reject_running(&slot, err);
            self.promote(&mut state);
            return;
        }

        if state.current.as_ref().is_some_and(|slot| slot.task.id() == id) {
            if let Some(mut slot) = state.current.take() {
                debug!(%id, "Timekeeper::abort: aborting open task");
                slot.disarm();
                if let Some(metrics) = &self.metrics {
                    metrics.abort(&slot.task, &err);
                }
                self.reject_pending(slot, err);
            }
            return;
        }

        if !self.remove_waiting(&mut state, id, err) {
            debug!(%id, "Timekeeper::abort: unknown task");
        }
    }

    /// Waiting-timer path: acts only while `id` is still queued
    fn expire_waiting(self: &Arc<Self>, id: &TaskId, err: LoaderError) {
        let mut state = lock(&self.state);
        if self.remove_waiting(&mut state, id, err) {
            warn!(%id, "Timekeeper: task waited too long in queue");
        } else {
            debug!(%id, "Timekeeper::expire_waiting: task already left the queue");
        }
    }

    fn remove_waiting(self: &Arc<Self>, state: &mut State<D>, id: &TaskId, err: LoaderError) -> bool {
        let Some(pos) = state.waiting.iter().position(|slot| slot.task.id() == id) else {
            return false;
        };
        let Some(mut slot) = state.waiting.remove(pos) else {
            return false;
        };
        debug!(%id, "Timekeeper::remove_waiting: removing task from waiting queue");
        slot.disarm();
        if let Some(metrics) = &self.metrics {
            metrics.abort(&slot.task, &err);
        }
        self.reject_pending(slot, err);
        true
    }

    fn clear(self: &Arc<Self>) {
        // Queued tasks go first so aborting a running task cannot promote them.
        let ids: Vec<TaskId> = {
            let state = lock(&self.state);
            state
                .waiting
                .iter()
                .map(|slot| slot.task.id().clone())
                .chain(state.current.iter().map(|slot| slot.task.id().clone()))
                .chain(state.running.keys().cloned())
                .collect()
        };
        debug!(count = ids.len(), "Timekeeper::clear: aborting tasks");
        for id in ids {
            self.abort(&id, Some(LoaderError::silent_abort("timekeeper")));
        }
    }

    fn find(&self, id: &TaskId) -> Option<TaskHandle<D>> {
        let state = lock(&self.state);
        state
            .current
            .iter()
            .chain(state.running.get(id))
            .chain(state.waiting.iter())
            .find(|slot| slot.task.id() == id)
            .map(|slot| slot.task.clone())
    }
}

#[async_trait]
impl<D, A> Scheduler<D> for Timekeeper<D, A>
where
    D: Send + 'static,
    A: Admission,
{
    fn current(&self) -> TaskHandle<D> {
        self.inner.current()
    }

    fn run(&self) {
        self.inner.run(None)
    }

    fn close(&self, id: &TaskId) {
        self.inner.run(Some(id))
    }

    fn abort(&self, id: &TaskId, reason: Option<LoaderError>) {
        self.inner.abort(id, reason)
    }

    async fn wait(&self, task: &TaskHandle<D>) -> Result<(), LoaderError> {
        task.settled().await
    }

    async fn wait_id(&self, id: &TaskId) -> Result<(), LoaderError> {
        match self.inner.find(id) {
            Some(task) => task.settled().await,
            None => {
                debug!(%id, "Timekeeper::wait_id: unknown task");
                Ok(())
            }
        }
    }

    fn clear(&self) {
        self.inner.clear()
    }

    fn find(&self, id: &TaskId) -> Option<TaskHandle<D>> {
        self.inner.find(id)
    }

    fn running_count(&self) -> usize {
        lock(&self.inner.state).running.len()
    }

    fn waiting(&self) -> Vec<TaskHandle<D>> {
        lock(&self.inner.state)
            .waiting
            .iter()
            .map(|slot| slot.task.clone())
            .collect()
    }
}
