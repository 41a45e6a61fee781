//! Cooperative job loop for Open Peer Power
//!
//! The [`EventLoop`] owns a FIFO queue of [`Work`] items drained by a single
//! dispatcher task. Each item is routed by its tag:
//!
//! - inline callbacks run directly on the dispatcher, in queue order
//! - coroutines are polled by the dispatcher itself, so they start in queue
//!   order and never run in parallel with each other or with callbacks
//! - executor jobs run on `spawn_blocking`, bounded by a semaphore sized to
//!   the worker count
//!
//! Every queued item holds a pending-count guard until it settles, which is
//! what [`EventLoop::block_till_done`] waits on. Jobs and callbacks queued
//! from inside a [`Scope`] are also counted against that scope, transitively,
//! so a caller can wait for one job and the listeners it set in motion.
//! Background work (`create_task`, `spawn`, `add_executor_job`) is detached
//! and never joins a scope. Panics are caught and logged; they never take the
//! dispatcher down.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use opp_core::{Job, Work};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, error, warn};

tokio::task_local! {
    static CURRENT_SCOPE: Arc<Tracker>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The job panicked, or was dropped because the loop is closed
    #[error("job did not complete")]
    Dropped,
}

/// Awaitable result of a job submitted to the loop
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| JobError::Dropped))
    }
}

#[derive(Default)]
struct Tracker {
    pending: AtomicUsize,
    idle: Notify,
}

impl Tracker {
    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Keeps an item counted as pending until dropped
struct PendingGuard {
    tracker: Arc<Tracker>,
}

impl PendingGuard {
    fn new(tracker: &Arc<Tracker>) -> Self {
        tracker.pending.fetch_add(1, Ordering::AcqRel);
        Self {
            tracker: Arc::clone(tracker),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.tracker.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// A set of work that started from one job
///
/// Everything queued while a job of the scope runs joins the scope, and so
/// does everything those items queue in turn. Created by
/// [`EventLoop::run_scoped`].
pub struct Scope {
    tracker: Arc<Tracker>,
}

impl Scope {
    /// Number of items of this scope that have not settled
    pub fn pending(&self) -> usize {
        self.tracker.pending()
    }

    /// Wait until every item of this scope has settled
    pub async fn wait(&self) {
        self.tracker.wait_idle().await
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("pending", &self.pending())
            .finish()
    }
}

struct Queued {
    work: Work,
    scope: Option<Arc<Tracker>>,
    guards: (PendingGuard, Option<PendingGuard>),
}

/// Handle to the job loop; clones share the same queue
#[derive(Clone)]
pub struct EventLoop {
    tx: mpsc::UnboundedSender<Queued>,
    tracker: Arc<Tracker>,
    executor: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    workers: usize,
}

impl EventLoop {
    /// Start a loop with one executor worker per available CPU
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::with_workers(workers)
    }

    /// Start a loop with a fixed executor pool size
    pub fn with_workers(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Arc::new(Semaphore::new(workers));

        tokio::spawn(dispatch(rx, Arc::clone(&executor)));
        debug!(workers, "Event loop started");

        Self {
            tx,
            tracker: Arc::new(Tracker::default()),
            executor,
            closed: Arc::new(AtomicBool::new(false)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue a bound work item; returns false if the loop is closed
    ///
    /// An item queued from inside a scope joins that scope.
    pub fn add_work(&self, work: Work) -> bool {
        let scope = CURRENT_SCOPE.try_with(Arc::clone).ok();
        self.enqueue(work, scope)
    }

    fn enqueue(&self, work: Work, scope: Option<Arc<Tracker>>) -> bool {
        if self.is_closed() {
            warn!(kind = ?work.job_type(), "Event loop is closed, dropping job");
            return false;
        }
        let guards = (
            PendingGuard::new(&self.tracker),
            scope.as_ref().map(PendingGuard::new),
        );
        self.tx.send(Queued { work, scope, guards }).is_ok()
    }

    /// Dispatch `job` with `arg`, discarding its result
    pub fn add_job<A, R>(&self, job: &Job<A, R>, arg: A) -> bool
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        self.add_work(job.bind(arg, |_| ()))
    }

    /// Dispatch `job` with `arg` and return a handle to its result
    pub fn run_job<A, R>(&self, job: &Job<A, R>, arg: A) -> JobHandle<R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.add_work(job.bind(arg, move |r| {
            let _ = tx.send(r);
        }));
        JobHandle { rx }
    }

    /// Dispatch `job` with `arg` as the root of a new [`Scope`]
    ///
    /// The handle resolves with the job's result; the scope settles once
    /// the job and all work queued on its behalf have settled.
    pub fn run_scoped<A, R>(&self, job: &Job<A, R>, arg: A) -> (JobHandle<R>, Scope)
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let tracker = Arc::new(Tracker::default());
        let (tx, rx) = oneshot::channel();
        let work = job.bind(arg, move |r| {
            let _ = tx.send(r);
        });
        self.enqueue(work, Some(Arc::clone(&tracker)));
        (JobHandle { rx }, Scope { tracker })
    }

    /// Run a non-blocking closure on the loop
    pub fn call_soon<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_work(Work::Inline(Box::new(f)))
    }

    /// Schedule a background future; panics are logged and swallowed
    ///
    /// The task is detached: it counts toward [`EventLoop::block_till_done`]
    /// but never toward the scope it was created in.
    pub fn create_task<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(Work::Task(Box::pin(fut)), None)
    }

    /// Schedule a future and return a handle to its output
    pub fn spawn<F, T>(&self, fut: F) -> JobHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            Work::Task(Box::pin(async move {
                let _ = tx.send(fut.await);
            })),
            None,
        );
        JobHandle { rx }
    }

    /// Run a blocking function on the executor pool, detached from any scope
    pub fn add_executor_job<F, T>(&self, f: F) -> JobHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            Work::Blocking(Box::new(move || {
                let _ = tx.send(f());
            })),
            None,
        );
        JobHandle { rx }
    }

    /// Number of queued or running items
    pub fn pending(&self) -> usize {
        self.tracker.pending()
    }

    /// Wait until every queued job, task and executor job has settled
    ///
    /// Work queued while waiting is waited for too. Calling this from inside
    /// a job never returns, since the caller counts as pending.
    pub async fn block_till_done(&self) {
        self.tracker.wait_idle().await
    }

    /// Wait until everything queued before this call has been dispatched
    ///
    /// Unlike [`EventLoop::block_till_done`] this does not wait for
    /// coroutines or executor jobs to finish.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.call_soon(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }

    /// Drain outstanding work, then refuse new work
    ///
    /// Returns false if work was still pending when `timeout` expired.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, self.block_till_done())
            .await
            .is_ok();
        if !drained {
            warn!(pending = self.pending(), "Timed out waiting for jobs to finish");
        }
        self.closed.store(true, Ordering::Release);
        self.executor.close();
        debug!("Event loop closed");
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .field("workers", &self.workers)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Queued>, executor: Arc<Semaphore>) {
    let mut tasks: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
    loop {
        // Running tasks are polled before the next item is taken, so a task
        // gets its first poll before anything queued after it.
        tokio::select! {
            biased;
            Some(()) = tasks.next(), if !tasks.is_empty() => {}
            queued = rx.recv() => match queued {
                Some(queued) => {
                    if let Some(task) = run(queued, &executor) {
                        tasks.push(task);
                    }
                }
                None => break,
            },
        }
    }
    while tasks.next().await.is_some() {}
    debug!("Event loop queue closed");
}

/// Run an item; coroutines are handed back for the dispatcher to poll
fn run(queued: Queued, executor: &Arc<Semaphore>) -> Option<BoxFuture<'static, ()>> {
    let Queued { work, scope, guards } = queued;
    match work {
        Work::Inline(f) => {
            let result = in_scope(scope, || std::panic::catch_unwind(AssertUnwindSafe(f)));
            if let Err(panic) = result {
                error!(kind = "callback", "Error running job: {}", panic_message(&*panic));
            }
            drop(guards);
            None
        }
        Work::Task(fut) => Some(
            async move {
                let fut = AssertUnwindSafe(fut).catch_unwind();
                let result = match scope {
                    Some(scope) => CURRENT_SCOPE.scope(scope, fut).await,
                    None => fut.await,
                };
                if let Err(panic) = result {
                    error!(kind = "coroutine", "Error running job: {}", panic_message(&*panic));
                }
                drop(guards);
            }
            .boxed(),
        ),
        Work::Blocking(f) => {
            let executor = Arc::clone(executor);
            tokio::spawn(async move {
                let Ok(_permit) = executor.acquire_owned().await else {
                    warn!("Executor is shut down, dropping job");
                    return;
                };
                let result = tokio::task::spawn_blocking(move || {
                    in_scope(scope, || std::panic::catch_unwind(AssertUnwindSafe(f)))
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(panic)) => {
                        error!(kind = "executor", "Error running job: {}", panic_message(&*panic));
                    }
                    Err(e) => error!(kind = "executor", "Executor job failed: {}", e),
                }
                drop(guards);
            });
            None
        }
    }
}

fn in_scope<T>(scope: Option<Arc<Tracker>>, f: impl FnOnce() -> T) -> T {
    match scope {
        Some(scope) => CURRENT_SCOPE.sync_scope(scope, f),
        None => f(),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
