//! Per-volume mutual exclusion.
//!
//! The transport layer dispatches every RPC on its own Tokio task, so the
//! Controller and Node services provide their own per-key locking: one
//! [`tokio::sync::Mutex`] per volume key, created lazily and removed again
//! once no task holds or waits on it.  Operations on the same key serialize;
//! operations on different keys proceed in parallel.
//!
//! Acquisition is bounded: a task that cannot take the lock within the
//! arena's deadline fails with [`CsiError::OperationPending`] (`Aborted`),
//! which the orchestrator retries.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::CsiError;

/// Upper bound on how long an operation waits for a same-key predecessor.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lazily-populated arena of per-key locks.
pub struct VolumeLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl Default for VolumeLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeLocks {
    /// Create an arena with the default acquisition deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Create an arena with a custom acquisition deadline.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Acquire the lock for `key`, serializing with other holders of the
    /// same key.
    ///
    /// Returns [`CsiError::OperationPending`] if the lock cannot be taken
    /// before the arena deadline elapses.
    pub async fn lock(&self, key: &str) -> Result<VolumeLockGuard<'_>, CsiError> {
        let mutex = self.locks.entry(key.to_owned()).or_default().clone();
        let guard = tokio::time::timeout(self.timeout, mutex.lock_owned())
            .await
            .map_err(|_| CsiError::OperationPending(key.to_owned()))?;
        Ok(VolumeLockGuard {
            key: key.to_owned(),
            guard: Some(guard),
            arena: &self.locks,
        })
    }

    /// Number of keys currently present in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the arena currently holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Guard returned by [`VolumeLocks::lock`].
///
/// Dropping the guard releases the lock and garbage-collects the arena
/// entry when no other task holds or waits on the same key.
#[derive(Debug)]
pub struct VolumeLockGuard<'a> {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    arena: &'a DashMap<String, Arc<Mutex<()>>>,
}

impl Drop for VolumeLockGuard<'_> {
    fn drop(&mut self) {
        // Release the mutex before inspecting the refcount, so the only
        // remaining strong reference for an idle key is the arena's own.
        self.guard.take();
        self.arena
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_contention_aborts() {
        let locks = VolumeLocks::with_timeout(Duration::from_millis(50));
        let _held = locks.lock("vol-1").await.unwrap();

        let err = locks.lock("vol-1").await.unwrap_err();
        assert!(matches!(err, CsiError::OperationPending(_)));
        assert_eq!(err.code(), crate::error::Code::Aborted);
    }

    #[tokio::test]
    async fn different_keys_proceed_in_parallel() {
        let locks = VolumeLocks::with_timeout(Duration::from_millis(50));
        let _a = locks.lock("vol-a").await.unwrap();
        let _b = locks.lock("vol-b").await.unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn released_key_can_be_relocked() {
        let locks = VolumeLocks::with_timeout(Duration::from_millis(50));
        drop(locks.lock("vol-1").await.unwrap());
        drop(locks.lock("vol-1").await.unwrap());
        assert!(locks.is_empty(), "idle entries must be garbage-collected");
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = Arc::new(VolumeLocks::with_timeout(Duration::from_secs(5)));
        let guard = locks.lock("vol-1").await.unwrap();

        let locks2 = Arc::clone(&locks);
        let waiter = tokio::spawn(async move { locks2.lock("vol-1").await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        waiter.await.unwrap().unwrap();
    }
}
