//! Cancellation signal handed to every runner
//!
//! A [`CancellationToken`] that also remembers *why* it was cancelled. The
//! first reason wins; later aborts are ignored.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::LoaderError;

#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<LoaderError>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that is already cancelled with `reason`
    pub fn aborted(reason: LoaderError) -> Self {
        let signal = Self::new();
        signal.abort(reason);
        signal
    }

    /// Cancel with `reason`. Returns false if the signal was already aborted.
    pub fn abort(&self, reason: LoaderError) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        debug!(reason = ?self.reason.get(), "AbortSignal::abort: cancelling");
        self.token.cancel();
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<LoaderError> {
        self.reason.get().cloned()
    }

    /// Resolves once the signal is aborted
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The underlying token, for `select!` or child tokens
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Return the abort reason as an error if aborted
    pub fn check(&self) -> Result<(), LoaderError> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }
}
