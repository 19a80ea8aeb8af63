//! Strictly sequential execution of asynchronous device operations.
//!
//! Operations can be submitted from anywhere, including from several tasks at
//! once. Each one is a thunk that isn't started until every operation
//! submitted before it has finished (including any timed waits inside it), so
//! the device never sees two of them at the same time.
//!
//! A single worker task owns execution. Submitting an operation pushes it
//! onto a shared list and wakes the worker; when an operation finishes, the
//! worker moves on to the next one. A failing (or panicking) operation only
//! affects its own caller.

use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt as _};
use tokio::{
    sync::{oneshot, Notify},
    task::JoinHandle,
};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct Pending {
    jobs: VecDeque<Job>,
    running: bool,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<Pending>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        // Jobs never run while the lock is held, so a poisoned lock still
        // holds a consistent list.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct CommandQueue {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl CommandQueue {
    /// Creates an empty queue and its worker task.
    ///
    /// This must be called from within a tokio runtime.
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let worker = tokio::spawn(run(shared.clone()));
        CommandQueue { shared, worker }
    }

    /// Submits an operation without waiting for anything.
    ///
    /// The returned [`Completion`] resolves with the operation's result once
    /// it (and everything submitted before it) has finished. If the operation
    /// is discarded by [`CommandQueue::clear`] it resolves with
    /// [`Error::Cancelled`].
    pub fn enqueue<F, Fut, T>(&self, op: F) -> Completion<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                match AssertUnwindSafe(async move { op().await })
                    .catch_unwind()
                    .await
                {
                    Ok(result) => {
                        // The caller is allowed to stop caring about the result.
                        let _ = tx.send(result);
                    }
                    Err(_) => log::error!("queued operation panicked"),
                }
            }
            .boxed()
        });

        self.shared.lock().jobs.push_back(job);
        self.shared.wake.notify_one();
        Completion::waiting(rx)
    }

    /// Resolves once everything submitted so far has finished.
    pub fn flush(&self) -> Completion<()> {
        self.enqueue(|| async { Ok(()) })
    }

    /// Is anything waiting or running?
    pub fn is_busy(&self) -> bool {
        let pending = self.shared.lock();
        pending.running || !pending.jobs.is_empty()
    }

    /// Discards every operation that hasn't started yet, returning how many
    /// there were. An operation that is already running is unaffected.
    pub fn clear(&self) -> usize {
        let dropped = std::mem::take(&mut self.shared.lock().jobs);
        // Dropping the jobs (outside the lock) drops their result senders,
        // which is what resolves their completions with `Cancelled`.
        dropped.len()
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut pending = shared.lock();
            let job = pending.jobs.pop_front();
            pending.running = job.is_some();
            job
        };

        match job {
            Some(job) => {
                job().await;
                shared.lock().running = false;
            }
            // If something was pushed since we looked, `notify_one` left a
            // permit behind and this returns immediately.
            None => shared.wake.notified().await,
        }
    }
}

/// The eventual result of a submitted operation.
#[must_use = "a completion does nothing unless awaited, but the operation runs regardless"]
pub struct Completion<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Ready(Option<Result<T>>),
    Waiting(oneshot::Receiver<Result<T>>),
}

impl<T> Completion<T> {
    /// A completion that has already resolved, for operations that finish
    /// (or fail) without touching the queue.
    pub fn ready(result: Result<T>) -> Self {
        Completion {
            inner: Inner::Ready(Some(result)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Result<T>>) -> Self {
        Completion {
            inner: Inner::Waiting(rx),
        }
    }
}

impl<T: Send + 'static> Completion<T> {
    /// Starts `fut` on a task of its own, bypassing the queue. It runs to the
    /// end whether or not the completion is awaited.
    pub(crate) fn spawn<Fut>(fut: Fut) -> Self
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
        Completion::waiting(rx)
    }
}

// We never pin-project into `T`.
impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        match &mut self.get_mut().inner {
            Inner::Ready(result) => Poll::Ready(
                result
                    .take()
                    .expect("Completion polled after it resolved"),
            ),
            Inner::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.unwrap_or(Err(Error::Cancelled))),
        }
    }
}
