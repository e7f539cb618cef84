//! A fixed set of worker threads consuming an unbounded FIFO task
//! queue.
//!
//! Tasks are boxed closures executed exactly once, in submission
//! order. A panicking task does not take its worker down: the captured
//! payload is handed to the pool's panic handler, and when no handler
//! is installed the process is aborted -- a pool that silently loses
//! workers or swallows failures corrupts every invariant built on top
//! of it.

use log::error;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::Arc;
use std::thread;

use crate::guard::Signaled;

/// A unit of work submitted to a [`ThreadPool`].
pub type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// What a panicking task leaves behind, as captured by `catch_unwind`.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

type PanicHandler = dyn Fn(PanicPayload) + Send + Sync;

/// The queue shared between submitters and workers. Mutated only under
/// the pool's lock; waking waiters happens through the surrounding
/// [`Signaled`] guard.
pub(crate) struct TaskQueue {
    quit: bool,
    tasks: VecDeque<Thunk>,
}

impl TaskQueue {
    fn new() -> Self {
        Self {
            quit: false,
            tasks: VecDeque::new(),
        }
    }

    fn push(&mut self, task: Thunk) -> bool {
        if self.quit {
            return false;
        }

        self.tasks.push_back(task);
        true
    }

    fn stop(&mut self) {
        self.quit = true;
    }
}

/// Appends a task to the queue and wakes one worker. Returns `false`
/// once the pool has begun shutting down.
pub(crate) fn submit(queue: &Signaled<TaskQueue>, task: Thunk) -> bool {
    let accepted = queue.with(|q| q.push(task));

    if accepted {
        queue.notify_one();
    }

    accepted
}

/// A thread pool with a fixed number of workers.
///
/// Dropping the pool shuts it down: submission stops, all workers are
/// woken and joined. Tasks already running complete; tasks still queued
/// at that point are discarded.
///
/// ```
/// use encore::pool::ThreadPool;
///
/// let pool = ThreadPool::new(2);
///
/// assert!(pool.add_task(|| println!("hello from a worker")));
/// ```
pub struct ThreadPool {
    queue: Arc<Signaled<TaskQueue>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool of `thread_count` workers. A panicking task
    /// aborts the process; install a handler with
    /// [`ThreadPool::with_handler`] to observe panics instead.
    pub fn new(thread_count: usize) -> Self {
        Self::build(thread_count, None)
    }

    /// Creates a pool of `thread_count` workers whose task panics are
    /// delivered to `handler`.
    pub fn with_handler<H>(thread_count: usize, handler: H) -> Self
    where
        H: Fn(PanicPayload) + Send + Sync + 'static,
    {
        Self::build(thread_count, Some(Arc::new(handler)))
    }

    fn build(thread_count: usize, handler: Option<Arc<PanicHandler>>) -> Self {
        let queue = Arc::new(Signaled::new(TaskQueue::new()));

        let workers = (0..thread_count)
            .map(|_| {
                let queue = queue.clone();
                let handler = handler.clone();

                thread::spawn(move || Self::run_worker(queue, handler))
            })
            .collect();

        Self { queue, workers }
    }

    /// Appends a task to the queue and wakes one worker. Returns
    /// `false` once shutdown has begun; an accepted task is executed
    /// exactly once.
    pub fn add_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        submit(&self.queue, Box::new(task))
    }

    /// A shareable handle onto the submission queue, for subsystems
    /// that dispatch into this pool without owning it. Once the pool
    /// is dropped the handle keeps working but every submission is
    /// refused.
    pub(crate) fn task_queue(&self) -> Arc<Signaled<TaskQueue>> {
        self.queue.clone()
    }

    fn run_worker(queue: Arc<Signaled<TaskQueue>>, handler: Option<Arc<PanicHandler>>) {
        while let Some(task) = Self::next_task(&queue) {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                match &handler {
                    Some(handler) => {
                        let deliver = AssertUnwindSafe(|| handler(payload));

                        if panic::catch_unwind(deliver).is_err() {
                            error!("panic handler itself panicked, report dropped");
                        }
                    }

                    None => {
                        // without a handler there is nowhere safe to
                        // report the failure
                        process::abort();
                    }
                }
            }
        }
    }

    /// Blocking pop. Returns `None` once shutdown is observed; the
    /// shutdown check deliberately precedes the pop, so tasks still
    /// queued at that point are discarded rather than raced against
    /// teardown.
    fn next_task(queue: &Signaled<TaskQueue>) -> Option<Thunk> {
        let mut locked = queue.lock();

        loop {
            if locked.quit {
                return None;
            }

            if let Some(task) = locked.tasks.pop_front() {
                return Some(task);
            }

            locked.wait(|q| q.quit || !q.tasks.is_empty());
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.queue.with(TaskQueue::stop);
        self.queue.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
