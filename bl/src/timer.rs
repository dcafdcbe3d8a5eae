//! One-shot timers backed by spawned tokio tasks
//!
//! A timer owns either a strong or a weak reference to whatever armed it.
//! With `unref` set, dropping the owner lets pending timers lapse silently;
//! otherwise the timer keeps the owner alive until it fires.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

pub(crate) enum OwnerRef<T> {
    Strong(Arc<T>),
    Weak(Weak<T>),
}

impl<T> OwnerRef<T> {
    pub(crate) fn new(owner: &Arc<T>, unref: bool) -> Self {
        if unref {
            OwnerRef::Weak(Arc::downgrade(owner))
        } else {
            OwnerRef::Strong(Arc::clone(owner))
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<T>> {
        match self {
            OwnerRef::Strong(owner) => Some(Arc::clone(owner)),
            OwnerRef::Weak(owner) => owner.upgrade(),
        }
    }
}

/// Arm a timer that calls `fire` with the owner after `delay`
pub(crate) fn spawn_timer<T, F>(owner: &Arc<T>, unref: bool, delay: Duration, fire: F) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: FnOnce(&Arc<T>) + Send + 'static,
{
    let owner = OwnerRef::new(owner, unref);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(owner) = owner.upgrade() {
            fire(&owner);
        }
    })
}

/// Lock a registry mutex; a panic elsewhere must not wedge the scheduler
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = spawn_timer(&hits, false, Duration::from_millis(50), |hits| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        handle.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_timer_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = spawn_timer(&hits, false, Duration::from_millis(50), |hits| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unref_timer_lapses_when_owner_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let owner = Arc::new(Arc::clone(&hits));
        let handle = spawn_timer(&owner, true, Duration::from_millis(50), |owner| {
            owner.fetch_add(1, Ordering::SeqCst);
        });
        drop(owner);

        handle.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
