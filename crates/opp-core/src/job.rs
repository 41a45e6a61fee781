//! Jobs: work tagged with the venue it must run in
//!
//! Every callable handed to the kernel (event listeners, timers, service
//! handlers) is wrapped in a [`Job`] at registration time. The tag decides
//! where it runs:
//!
//! - [`Job::Callback`] runs inline on the loop and must not block
//! - [`Job::Coroutine`] is spawned as a task
//! - [`Job::Executor`] is sent to the bounded blocking pool
//!
//! A job bound to its argument becomes a [`Work`] item, which the loop
//! dispatches by matching on the variant.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed, sendable future
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Discriminant of a [`Job`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Callback,
    Coroutine,
    Executor,
}

/// A reusable callable taking `A` and producing `R`, tagged with its venue
pub enum Job<A, R = ()> {
    Callback(Arc<dyn Fn(A) -> R + Send + Sync>),
    Coroutine(Arc<dyn Fn(A) -> BoxFuture<R> + Send + Sync>),
    Executor(Arc<dyn Fn(A) -> R + Send + Sync>),
}

impl<A, R> Clone for Job<A, R> {
    fn clone(&self) -> Self {
        match self {
            Job::Callback(f) => Job::Callback(Arc::clone(f)),
            Job::Coroutine(f) => Job::Coroutine(Arc::clone(f)),
            Job::Executor(f) => Job::Executor(Arc::clone(f)),
        }
    }
}

impl<A, R> std::fmt::Debug for Job<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Job").field(&self.job_type()).finish()
    }
}

impl<A, R> Job<A, R> {
    pub fn job_type(&self) -> JobType {
        match self {
            Job::Callback(_) => JobType::Callback,
            Job::Coroutine(_) => JobType::Coroutine,
            Job::Executor(_) => JobType::Executor,
        }
    }
}

impl<A, R> Job<A, R>
where
    A: Send + 'static,
    R: Send + 'static,
{
    /// A non-blocking function run directly on the loop
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Job::Callback(Arc::new(f))
    }

    /// An async function spawned as a task
    pub fn coroutine<F, Fut>(f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Job::Coroutine(Arc::new(move |arg| Box::pin(f(arg)) as BoxFuture<R>))
    }

    /// A blocking function run on the executor pool
    pub fn executor<F>(f: F) -> Self
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        Job::Executor(Arc::new(f))
    }

    /// Adapt the job to take `B`, keeping its venue
    ///
    /// `f` runs wherever the job runs, so it must be as cheap as the job's
    /// own tag requires.
    pub fn map_input<B, F>(&self, f: F) -> Job<B, R>
    where
        B: Send + 'static,
        F: Fn(B) -> A + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        match self {
            Job::Callback(inner) => {
                let inner = Arc::clone(inner);
                Job::Callback(Arc::new(move |b| inner(f(b))))
            }
            Job::Coroutine(inner) => {
                let inner = Arc::clone(inner);
                Job::Coroutine(Arc::new(move |b| inner(f(b))))
            }
            Job::Executor(inner) => {
                let inner = Arc::clone(inner);
                Job::Executor(Arc::new(move |b| inner(f(b))))
            }
        }
    }

    /// Bind the job to an argument
    ///
    /// `reply` receives the result once the job has run. It is dropped
    /// without being called if the job panics.
    pub fn bind<F>(&self, arg: A, reply: F) -> Work
    where
        F: FnOnce(R) + Send + 'static,
    {
        match self {
            Job::Callback(f) => {
                let f = Arc::clone(f);
                Work::Inline(Box::new(move || reply(f(arg))))
            }
            Job::Coroutine(f) => {
                let f = Arc::clone(f);
                Work::Task(Box::pin(async move { reply(f(arg).await) }))
            }
            Job::Executor(f) => {
                let f = Arc::clone(f);
                Work::Blocking(Box::new(move || reply(f(arg))))
            }
        }
    }
}

/// A job bound to its argument, ready for dispatch
pub enum Work {
    Inline(Box<dyn FnOnce() + Send>),
    Task(BoxFuture<()>),
    Blocking(Box<dyn FnOnce() + Send>),
}

impl Work {
    pub fn job_type(&self) -> JobType {
        match self {
            Work::Inline(_) => JobType::Callback,
            Work::Task(_) => JobType::Coroutine,
            Work::Blocking(_) => JobType::Executor,
        }
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Work").field(&self.job_type()).finish()
    }
}
