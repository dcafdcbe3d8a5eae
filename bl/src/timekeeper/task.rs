//! Task types for the timekeeper

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::LoaderError;
use crate::timer::lock;

/// Opaque task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task lifecycle: `Pending -> Running -> Resolved | Rejected`, or
/// `Pending -> Rejected` when aborted before it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Resolved,
    Rejected,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Resolved | TaskStatus::Rejected)
    }
}

struct TaskState<D> {
    status: TaskStatus,
    data: D,
    run_at: Option<Instant>,
}

struct TaskShared<D> {
    id: TaskId,
    created_at: Instant,
    state: Mutex<TaskState<D>>,
    outcome: watch::Sender<Option<Result<(), LoaderError>>>,
}

/// Shared handle to a task owned by a timekeeper
///
/// Status transitions are only made by the owning timekeeper. Callers may
/// read the status, append to the payload while the task is still pending,
/// and wait for it to settle.
pub struct TaskHandle<D> {
    shared: Arc<TaskShared<D>>,
}

impl<D> Clone for TaskHandle<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D> fmt::Debug for TaskHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

impl<D> TaskHandle<D> {
    pub(crate) fn new(data: D) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            shared: Arc::new(TaskShared {
                id: TaskId::new(),
                created_at: Instant::now(),
                state: Mutex::new(TaskState {
                    status: TaskStatus::Pending,
                    data,
                    run_at: None,
                }),
                outcome,
            }),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.shared.id
    }

    pub fn status(&self) -> TaskStatus {
        lock(&self.shared.state).status
    }

    pub fn created_at(&self) -> Instant {
        self.shared.created_at
    }

    pub fn run_at(&self) -> Option<Instant> {
        lock(&self.shared.state).run_at
    }

    /// Access the payload regardless of status
    pub fn with_data<T>(&self, f: impl FnOnce(&mut D) -> T) -> T {
        f(&mut lock(&self.shared.state).data)
    }

    /// Mutate the payload only while the task is still pending.
    ///
    /// Returns `None` once the task has been handed to a runner (or settled),
    /// in which case the caller should fetch a fresh task.
    pub fn update_pending<T>(&self, f: impl FnOnce(&mut D) -> T) -> Option<T> {
        let mut state = lock(&self.shared.state);
        if state.status != TaskStatus::Pending {
            return None;
        }
        Some(f(&mut state.data))
    }

    pub fn is_settled(&self) -> bool {
        self.shared.outcome.borrow().is_some()
    }

    /// Wait until the task is resolved or rejected
    pub async fn settled(&self) -> Result<(), LoaderError> {
        let mut rx = self.shared.outcome.subscribe();
        // The sender lives as long as `self`, so this only ends on a value.
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| Err(LoaderError::manual_abort("task dropped")))
    }

    pub(crate) fn mark_running(&self) -> bool {
        let mut state = lock(&self.shared.state);
        if state.status != TaskStatus::Pending {
            return false;
        }
        state.status = TaskStatus::Running;
        state.run_at = Some(Instant::now());
        true
    }

    pub(crate) fn resolve(&self) -> bool {
        {
            let mut state = lock(&self.shared.state);
            if state.status != TaskStatus::Running {
                return false;
            }
            state.status = TaskStatus::Resolved;
        }
        self.shared.outcome.send_replace(Some(Ok(())));
        true
    }

    pub(crate) fn reject(&self, err: LoaderError) -> bool {
        {
            let mut state = lock(&self.shared.state);
            if state.status.is_terminal() {
                return false;
            }
            state.status = TaskStatus::Rejected;
        }
        self.shared.outcome.send_replace(Some(Err(err)));
        true
    }
}
