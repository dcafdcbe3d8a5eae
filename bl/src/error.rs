//! Loader error types

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;

/// Why an abort happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// Explicit `abort()` without a more specific reason
    Manual,

    /// Teardown via `clear()`, not an application fault
    Silent,

    /// The operation already failed; raised only to unblock signal listeners
    RejectedCascade,
}

impl fmt::Display for AbortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortKind::Manual => write!(f, "manual"),
            AbortKind::Silent => write!(f, "silent"),
            AbortKind::RejectedCascade => write!(f, "rejected"),
        }
    }
}

/// Errors surfaced by the scheduler, deduplicator, aggregator and loader
///
/// Cloning is cheap; every waiter on a shared outcome gets a clone of the
/// same value, and upstream errors keep their `Arc` identity.
#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    #[error("Operation exceeded the maximum timeout of {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Aborted ({kind}): {reason}")]
    Aborted { kind: AbortKind, reason: String },

    #[error("Batch error: {0}")]
    Batch(String),

    #[error("{0}")]
    Upstream(Arc<dyn StdError + Send + Sync + 'static>),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl LoaderError {
    /// Wrap an error raised by a batch function or cache
    pub fn upstream<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        LoaderError::Upstream(Arc::from(err.into()))
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        LoaderError::Timeout { timeout_ms }
    }

    pub fn manual_abort(reason: impl Into<String>) -> Self {
        LoaderError::Aborted {
            kind: AbortKind::Manual,
            reason: reason.into(),
        }
    }

    pub fn silent_abort(source: impl Into<String>) -> Self {
        LoaderError::Aborted {
            kind: AbortKind::Silent,
            reason: format!("{} was cleared", source.into()),
        }
    }

    pub fn rejected_cascade(source: impl Into<String>) -> Self {
        LoaderError::Aborted {
            kind: AbortKind::RejectedCascade,
            reason: format!("{} was rejected", source.into()),
        }
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, LoaderError::Timeout { .. })
    }

    /// Check if this is an abort of any kind
    pub fn is_abort(&self) -> bool {
        matches!(self, LoaderError::Aborted { .. })
    }

    /// Check if this abort came from `clear()`
    pub fn is_silent_abort(&self) -> bool {
        matches!(
            self,
            LoaderError::Aborted {
                kind: AbortKind::Silent,
                ..
            }
        )
    }

    /// Check if the batch function broke its result contract
    pub fn is_batch(&self) -> bool {
        matches!(self, LoaderError::Batch(_))
    }

    pub fn is_upstream(&self) -> bool {
        matches!(self, LoaderError::Upstream(_))
    }

    /// Get the abort kind, if this is an abort
    pub fn abort_kind(&self) -> Option<AbortKind> {
        match self {
            LoaderError::Aborted { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Borrow the upstream error as a concrete type
    pub fn downcast_upstream<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            LoaderError::Upstream(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// Whether two errors are the same shared upstream instance
    pub fn same_upstream(&self, other: &LoaderError) -> bool {
        match (self, other) {
            (LoaderError::Upstream(a), LoaderError::Upstream(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Run a user-supplied future, turning a panic into an upstream error
pub(crate) async fn catch_panic<T, F>(fut: F) -> Result<T, LoaderError>
where
    F: Future<Output = Result<T, LoaderError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(LoaderError::upstream(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown payload".to_string());
    format!("runner panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("database unavailable")]
    struct DbDown;

    #[test]
    fn test_timeout_message() {
        let err = LoaderError::timeout(150);
        assert!(err.is_timeout());
        assert!(err.to_string().contains("150 ms"));
    }

    #[test]
    fn test_abort_kinds() {
        assert_eq!(LoaderError::manual_abort("stop").abort_kind(), Some(AbortKind::Manual));
        assert!(LoaderError::silent_abort("deduplicator").is_silent_abort());
        assert!(!LoaderError::rejected_cascade("deduplicator").is_silent_abort());
        assert_eq!(LoaderError::timeout(1).abort_kind(), None);
    }

    #[test]
    fn test_upstream_identity_survives_clone() {
        let err = LoaderError::upstream(DbDown);
        let joined = err.clone();

        assert!(err.same_upstream(&joined));
        assert!(joined.downcast_upstream::<DbDown>().is_some());
        assert_eq!(joined.to_string(), "database unavailable");

        let other = LoaderError::upstream(DbDown);
        assert!(!err.same_upstream(&other));
    }

    #[test]
    fn test_upstream_from_string() {
        let err = LoaderError::upstream("boom");
        assert!(err.is_upstream());
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_catch_panic_maps_to_upstream() {
        let err = catch_panic(async {
            if true {
                panic!("bad batch");
            }
            Ok::<u32, LoaderError>(1)
        })
        .await
        .unwrap_err();
        assert!(err.is_upstream());
        assert_eq!(err.to_string(), "runner panicked: bad batch");

        assert_eq!(catch_panic(async { Ok::<u32, LoaderError>(7) }).await.unwrap(), 7);
    }
}
