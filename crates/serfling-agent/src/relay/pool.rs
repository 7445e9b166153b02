//! Semaphore-based bound on concurrently running event handlers.
//!
//! Queries and parallel-mode events each run on their own task. The
//! [`HandlerPool`] caps how many of those tasks execute callbacks at once so
//! an event storm cannot spawn unbounded work. A relay without a limit runs
//! without a pool.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// One handler slot; released when dropped.
pub struct HandlerPermit {
    _permit: OwnedSemaphorePermit,
}

/// Shared concurrency limit for query and parallel-event handlers.
#[derive(Clone)]
pub struct HandlerPool {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
}

impl HandlerPool {
    /// Create a pool; a zero limit is raised to one.
    pub fn new(max_concurrency: usize) -> Self {
        let limit = max_concurrency.max(1);
        debug!(max_concurrency = limit, "HandlerPool created");
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrency: limit,
        }
    }

    /// Acquire a permit, waiting until one becomes available.
    pub async fn acquire(&self) -> Result<HandlerPermit, PoolError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(HandlerPermit { _permit: permit })
    }

    /// Stop handing out permits; pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Free handler slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Errors from the handler pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The semaphore was closed (relay shut down).
    #[error("Handler pool has been closed")]
    Closed,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_limit_is_raised_to_one() {
        let pool = HandlerPool::new(0);
        assert_eq!(pool.max_concurrency(), 1);
    }

    #[tokio::test]
    async fn permit_returned_on_drop() {
        let pool = HandlerPool::new(1);

        {
            let _permit = pool.acquire().await.unwrap();
            assert_eq!(pool.available_permits(), 0);
        }
        assert_eq!(pool.available_permits(), 1);
    }

    #[tokio::test]
    async fn acquire_waits_for_permit() {
        let pool = HandlerPool::new(1);
        let permit = pool.acquire().await.unwrap();

        let waiter = pool.clone();
        let handle = tokio::spawn(async move {
            waiter.acquire().await.unwrap();
        });

        drop(permit);

        tokio::time::timeout(std::time::Duration::from_millis(100), handle)
            .await
            .expect("acquire should complete after permit drop")
            .unwrap();
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let pool = HandlerPool::new(2);
        pool.close();
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }
}
