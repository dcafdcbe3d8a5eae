//! Observation hooks for timekeepers
//!
//! Every hook defaults to a no-op. Hooks run while the timekeeper holds its
//! registry lock and must not call back into the timekeeper.

use crate::error::LoaderError;

use super::task::TaskHandle;

pub trait TimekeeperMetrics<D>: Send + Sync {
    /// A new open task was created
    fn create(&self) {}

    /// The open task was closed explicitly rather than by its timer
    fn forced_run(&self) {}

    fn abort(&self, _task: &TaskHandle<D>, _error: &LoaderError) {}

    /// A task started running; `running` includes it
    fn run_task(&self, _running: usize, _task: &TaskHandle<D>) {}

    fn resolve_task(&self, _task: &TaskHandle<D>) {}

    fn reject_task(&self, _error: &LoaderError, _task: &TaskHandle<D>) {}

    /// A task was parked in the waiting queue; `waiting` includes it
    fn wait_task(&self, _waiting: usize) {}
}
