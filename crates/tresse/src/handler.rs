//! Per-connection dispatch policies.
//!
//! Both variants consume a FIFO queue of pending context tasks fed by the
//! connection's reader. The serial handler awaits each task to completion
//! in submission order, giving in-order side effects for stateful
//! protocols; the parallel handler runs tasks through a bounded
//! [`WorkerPool`] with no cross-task ordering.
//!
//! A `None` entry in the queue is the end-of-stream sentinel enqueued by
//! `shutdown()`: the run loop drains everything before it, then closes.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::AbortHandle;

use crate::config::DispatchMode;
use crate::connection::ConnectionHandle;
use crate::error::RpcError;
use crate::worker::WorkerPool;

/// A queued unit of dispatch work, typically a context's `run` future.
pub type ContextTask = Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send + 'static>>;

/// Close callback, invoked once with the close reason.
pub type CloseCallback = Box<dyn FnOnce(Option<&RpcError>) + Send>;

struct HandlerShared {
    queue: Mutex<VecDeque<Option<ContextTask>>>,
    task_signal: Notify,
    is_closing: AtomicBool,
    is_closed: AtomicBool,
    close_reason: Mutex<Option<RpcError>>,
    closed_tx: watch::Sender<bool>,
    conn: Mutex<Option<ConnectionHandle>>,
    run_task: Mutex<Option<AbortHandle>>,
    on_close: Mutex<Vec<CloseCallback>>,
}

#[derive(Clone)]
struct HandlerCore {
    shared: Arc<HandlerShared>,
}

impl HandlerCore {
    fn new() -> Self {
        Self {
            shared: Arc::new(HandlerShared {
                queue: Mutex::new(VecDeque::new()),
                task_signal: Notify::new(),
                is_closing: AtomicBool::new(false),
                is_closed: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                closed_tx: watch::Sender::new(false),
                conn: Mutex::new(None),
                run_task: Mutex::new(None),
                on_close: Mutex::new(Vec::new()),
            }),
        }
    }

    fn submit(&self, task: ContextTask) {
        if self.is_closing() {
            tracing::debug!("handler is closing, dropping submitted task");
            return;
        }
        self.shared.queue.lock().push_back(Some(task));
        self.shared.task_signal.notify_one();
    }

    /// Enqueue the end-of-stream sentinel, once.
    fn shutdown(&self) {
        if self.shared.is_closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.queue.lock().push_back(None);
        self.shared.task_signal.notify_one();
    }

    /// Record a failure reason and begin shutting down.
    fn initiate_close(&self, reason: RpcError) {
        self.record_reason(reason);
        if self.shared.is_closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.queue.lock().push_back(None);
        self.shared.task_signal.notify_one();
    }

    fn record_reason(&self, reason: RpcError) {
        let mut slot = self.shared.close_reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    fn pop(&self) -> Option<Option<ContextTask>> {
        self.shared.queue.lock().pop_front()
    }

    fn is_closing(&self) -> bool {
        self.shared.is_closing.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed.load(Ordering::Acquire)
    }

    fn attach(&self, conn: ConnectionHandle) {
        *self.shared.conn.lock() = Some(conn);
    }

    fn set_run_task(&self, handle: AbortHandle) {
        *self.shared.run_task.lock() = Some(handle);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.shared.on_close.lock().push(callback);
    }

    /// Close exactly once: clear the queue, fire callbacks, signal joiners,
    /// close the connection, cancel the run task.
    async fn close(&self, reason: Option<RpcError>) {
        if self.shared.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.is_closing.store(true, Ordering::Release);
        if let Some(reason) = reason {
            self.record_reason(reason);
        }
        let reason = self.shared.close_reason.lock().clone();
        let abandoned = {
            let mut queue = self.shared.queue.lock();
            let n = queue.iter().filter(|entry| entry.is_some()).count();
            queue.clear();
            n
        };
        if abandoned > 0 {
            tracing::debug!(abandoned, "handler closed with queued tasks abandoned");
        }

        let callbacks: Vec<CloseCallback> = std::mem::take(&mut *self.shared.on_close.lock());
        for callback in callbacks {
            callback(reason.as_ref());
        }

        let _ = self.shared.closed_tx.send_replace(true);
        self.shared.task_signal.notify_waiters();

        let conn = self.shared.conn.lock().clone();
        if let Some(conn) = conn {
            conn.close(reason).await;
        }

        // Last: if close came from outside the run loop, stop it; if it came
        // from inside, the loop returns right after this anyway.
        let run_task = self.shared.run_task.lock().take();
        if let Some(handle) = run_task {
            handle.abort();
        }
    }

    /// Await the closed event.
    async fn join(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Dispatch policy: strict FIFO, one task at a time.
///
/// Even streaming methods are handled in series; use this when a previous
/// request must be fully processed before the next one is looked at (a
/// session handshake, for instance).
#[derive(Clone)]
pub struct SerialHandler {
    core: HandlerCore,
}

impl SerialHandler {
    pub fn new() -> Self {
        Self {
            core: HandlerCore::new(),
        }
    }

    pub async fn run(&self) {
        loop {
            loop {
                if self.core.is_closed() {
                    return;
                }
                match self.core.pop() {
                    None => break,
                    Some(None) => {
                        self.core.close(None).await;
                        return;
                    }
                    Some(Some(task)) => {
                        if let Err(e) = task.await {
                            tracing::warn!(error = %e, "dispatch task failed, closing");
                            self.core.close(Some(e)).await;
                            return;
                        }
                    }
                }
            }
            if self.core.is_closed() {
                return;
            }
            self.core.shared.task_signal.notified().await;
        }
    }
}

impl Default for SerialHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch policy: bounded concurrency through a [`WorkerPool`].
///
/// Completion order is unconstrained. A failing task still closes the
/// handler and its connection, but only after the pool has drained, so no
/// orphaned task races a torn-down connection.
#[derive(Clone)]
pub struct ParallelHandler {
    core: HandlerCore,
    pool: WorkerPool,
}

impl ParallelHandler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            core: HandlerCore::new(),
            pool: WorkerPool::new(concurrency),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn run(&self) {
        loop {
            loop {
                if self.core.is_closed() {
                    return;
                }
                match self.core.pop() {
                    None => break,
                    Some(None) => {
                        self.pool.shutdown();
                        if let Err(e) = self.pool.join().await {
                            tracing::error!(error = %e, "pool join failed during drain");
                        }
                        self.core.close(None).await;
                        return;
                    }
                    Some(Some(task)) => {
                        let core = self.core.clone();
                        let wrapped = async move {
                            if let Err(e) = task.await {
                                tracing::warn!(
                                    error = %e,
                                    "dispatch task failed, closing after pool drain"
                                );
                                core.initiate_close(e);
                            }
                        };
                        // A shut-down pool means the sentinel is already
                        // queued behind us; the task is abandoned.
                        if self.pool.spawn(wrapped).await.is_err() {
                            tracing::debug!("pool shut down, dropping dispatch task");
                        }
                    }
                }
            }
            if self.core.is_closed() {
                return;
            }
            self.core.shared.task_signal.notified().await;
        }
    }
}

/// A connection's dispatch policy, selected by
/// [`DispatchMode`](crate::config::DispatchMode).
#[derive(Clone)]
pub enum Handler {
    Serial(SerialHandler),
    Parallel(ParallelHandler),
}

impl Handler {
    pub fn new(mode: DispatchMode) -> Self {
        match mode {
            DispatchMode::Serial => Self::Serial(SerialHandler::new()),
            DispatchMode::Parallel { concurrency } => {
                Self::Parallel(ParallelHandler::new(concurrency))
            }
        }
    }

    fn core(&self) -> &HandlerCore {
        match self {
            Self::Serial(h) => &h.core,
            Self::Parallel(h) => &h.core,
        }
    }

    /// Enqueue a task and signal the run loop.
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.core().submit(Box::pin(task));
    }

    /// Stop accepting tasks and let the run loop drain, then close.
    pub fn shutdown(&self) {
        self.core().shutdown();
    }

    pub async fn close(&self, reason: Option<RpcError>) {
        self.core().close(reason).await;
    }

    /// Await handler completion.
    pub async fn join(&self) {
        self.core().join().await;
    }

    pub fn is_closing(&self) -> bool {
        self.core().is_closing()
    }

    pub fn is_closed(&self) -> bool {
        self.core().is_closed()
    }

    /// Register a callback fired once on close.
    pub fn on_close(&self, callback: CloseCallback) {
        self.core().on_close(callback);
    }

    pub(crate) fn attach(&self, conn: ConnectionHandle) {
        self.core().attach(conn);
    }

    pub(crate) fn set_run_task(&self, handle: AbortHandle) {
        self.core().set_run_task(handle);
    }

    pub async fn run(&self) {
        match self {
            Self::Serial(h) => h.run().await,
            Self::Parallel(h) => h.run().await,
        }
    }
}
