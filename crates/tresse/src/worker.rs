//! Bounded-concurrency worker pool.
//!
//! Backs the parallel dispatch policy: tasks run concurrently subject to a
//! counting semaphore, and `join` waits for the live set to drain.

use core::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

tokio::task_local! {
    /// Id of the pool running the current task. Lets `join` reject the
    /// call-from-own-worker deadlock eagerly.
    static CURRENT_POOL: u64;
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Worker pool usage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// `spawn`/`submit` after `shutdown`.
    Shutdown,
    /// `join` called from inside a task the pool itself is running; it
    /// would deadlock waiting for its own completion.
    JoinFromWorker,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "pool has shut down"),
            Self::JoinFromWorker => {
                write!(f, "cannot join a worker pool from within one of its own tasks")
            }
        }
    }
}

impl std::error::Error for PoolError {}

/// Semaphore-gated task executor with a bounded live set.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: u64,
    size: usize,
    semaphore: Arc<Semaphore>,
    live: AtomicUsize,
    empty: Notify,
    has_shutdown: AtomicBool,
    executed: AtomicU64,
}

impl WorkerPool {
    /// Create a pool running at most `size` tasks concurrently.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool size must be positive");
        Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                size,
                semaphore: Arc::new(Semaphore::new(size)),
                live: AtomicUsize::new(0),
                empty: Notify::new(),
                has_shutdown: AtomicBool::new(false),
                executed: AtomicU64::new(0),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of tasks currently tracked (running or waiting for a permit).
    pub fn len(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total tasks completed over the pool's lifetime.
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// Run `fut` in the pool, suspending until a semaphore slot is free.
    pub async fn spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>, PoolError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.inner.has_shutdown.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore never closes");
        self.inner.live.fetch_add(1, Ordering::AcqRel);

        let inner = self.inner.clone();
        Ok(tokio::spawn(CURRENT_POOL.scope(inner.id, async move {
            let out = fut.await;
            drop(permit);
            inner.task_done();
            out
        })))
    }

    /// Run `fut` in the pool without waiting for a slot: the returned task
    /// itself awaits the semaphore, so this call never suspends.
    pub fn submit<F>(&self, fut: F) -> Result<JoinHandle<F::Output>, PoolError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.inner.has_shutdown.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        self.inner.live.fetch_add(1, Ordering::AcqRel);

        let inner = self.inner.clone();
        Ok(tokio::spawn(CURRENT_POOL.scope(inner.id, async move {
            let permit = inner
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("pool semaphore never closes");
            let out = fut.await;
            drop(permit);
            inner.task_done();
            out
        })))
    }

    /// Suspend until the live task set is empty.
    ///
    /// Rejected eagerly when called from a task this pool is running, since
    /// that would deadlock.
    pub async fn join(&self) -> Result<(), PoolError> {
        let inside = CURRENT_POOL
            .try_with(|id| *id == self.inner.id)
            .unwrap_or(false);
        if inside {
            return Err(PoolError::JoinFromWorker);
        }
        loop {
            let mut notified = pin!(self.inner.empty.notified());
            notified.as_mut().enable();
            if self.is_empty() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Stop accepting new tasks without cancelling in-flight ones.
    pub fn shutdown(&self) {
        self.inner.has_shutdown.store(true, Ordering::Release);
    }

    pub fn has_shutdown(&self) -> bool {
        self.inner.has_shutdown.load(Ordering::Acquire)
    }
}

impl PoolInner {
    fn task_done(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.empty.notify_waiters();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.inner.size)
            .field("live", &self.len())
            .field("has_shutdown", &self.has_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrency_never_exceeds_size() {
        let pool = WorkerPool::new(3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.join().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.executed(), 20);
    }

    #[tokio::test]
    async fn join_from_worker_is_rejected() {
        let pool = WorkerPool::new(2);
        let inner_pool = pool.clone();
        let handle = pool
            .spawn(async move { inner_pool.join().await })
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), Err(PoolError::JoinFromWorker));
    }

    #[tokio::test]
    async fn shutdown_stops_new_tasks_but_not_running_ones() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        let d = done.clone();
        pool.submit(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            d.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.shutdown();
        assert!(matches!(pool.submit(async {}), Err(PoolError::Shutdown)));
        assert!(matches!(pool.spawn(async {}).await, Err(PoolError::Shutdown)));

        pool.join().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn spawn_waits_for_a_slot() {
        let pool = WorkerPool::new(1);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o = order.clone();
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            o.lock().push(1);
        })
        .await
        .unwrap();

        // The slot is taken; this spawn suspends until the first completes.
        let o = order.clone();
        pool.spawn(async move {
            o.lock().push(2);
        })
        .await
        .unwrap();

        pool.join().await.unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
    }
}
