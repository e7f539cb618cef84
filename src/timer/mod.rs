//! Schedules closures for execution at a future instant by dispatching
//! them into a thread pool.
//!
//! A [`Timer`] owns a time-ordered queue of delayed tasks and a single
//! dispatcher thread. The dispatcher sleeps until the earliest task
//! falls due, then hands the task to the pool the timer was built
//! with. Each scheduled task is controlled through a [`Handle`]:
//!
//! ```
//! use encore::pool::ThreadPool;
//! use encore::timer::Timer;
//! use std::time::Duration;
//!
//! let pool = ThreadPool::new(2);
//! let timer = Timer::new(&pool, 128);
//!
//! let handle = timer.add_delayed_task(Duration::from_millis(500), || {
//!     println!("half a second later");
//! });
//!
//! assert!(handle.is_waiting());
//! handle.detach();
//! ```

mod queue;
mod task;

use log::debug;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::guard::Signaled;
use crate::pool::{self, TaskQueue, ThreadPool};

use self::queue::TimerQueue;
use self::task::DelayedTask;

/// What the dispatcher and the delayed tasks share: the pending-task
/// queue and a handle onto the pool's submission side. Tasks hold this
/// weakly, so a dropped timer simply makes restarts fail instead of
/// keeping the machinery alive.
pub(crate) struct TimerCore {
    queue: TimerQueue,
    pool: Arc<Signaled<TaskQueue>>,
}

impl TimerCore {
    /// Enqueues a task at a fresh due time. Used for the initial add
    /// and for the deferred restart of a task that just completed.
    pub(crate) fn enqueue(&self, task: &Arc<DelayedTask>) -> bool {
        self.queue.add(task)
    }

    /// Moves an already queued task to a fresh due time.
    pub(crate) fn requeue(&self, task: &DelayedTask) -> bool {
        self.queue.reschedule(task)
    }
}

/// A delayed-task scheduler backed by a [`ThreadPool`].
///
/// The pool is shared, not owned: several timers may dispatch into the
/// same pool, and the pool is shut down independently after the timers
/// using it. A pool shut down early refuses submissions, and the
/// affected tasks are cancelled.
///
/// Dropping the timer stops the dispatcher and cancels every task
/// still waiting in the queue. Tasks already handed to the pool run to
/// completion.
pub struct Timer {
    core: Arc<TimerCore>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl Timer {
    /// Creates a timer dispatching into `pool`, holding at most
    /// `max_queue_size` pending tasks.
    pub fn new(pool: &ThreadPool, max_queue_size: usize) -> Self {
        let core = Arc::new(TimerCore {
            queue: TimerQueue::new(max_queue_size),
            pool: pool.task_queue(),
        });

        let dispatcher = {
            let core = core.clone();

            thread::spawn(move || Self::dispatch(core))
        };

        Self {
            core,
            dispatcher: Some(dispatcher),
        }
    }

    /// Schedules `work` to run once `delay` has elapsed, counted from
    /// now on the monotonic clock.
    ///
    /// When the queue refuses the task (full or shutting down) the
    /// task is cancelled, which the returned handle reports.
    pub fn add_delayed_task<F>(&self, delay: Duration, work: F) -> Handle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let task = DelayedTask::new(delay, Box::new(work), Arc::downgrade(&self.core));

        if !self.core.enqueue(&task) {
            task.cancel();
        }

        Handle {
            task,
            cancel_on_drop: true,
        }
    }

    fn dispatch(core: Arc<TimerCore>) {
        while let Some(task) = core.queue.get() {
            let run = {
                let task = task.clone();

                Box::new(move || task.run())
            };

            if !pool::submit(&core.pool, run) {
                debug!("thread pool refused a due task, cancelling it");
                task.cancel();
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.core.queue.stop();

        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }

        for task in self.core.queue.drain() {
            task.cancel();
        }
    }
}

/// Externally held, move-only reference to a scheduled task.
///
/// Dropping the handle cancels the task, with the same semantics as
/// [`Handle::cancel`] -- including blocking while the task is running
/// on a worker. Call [`Handle::detach`] to let the task live on
/// unobserved instead.
pub struct Handle {
    task: Arc<DelayedTask>,
    cancel_on_drop: bool,
}

impl Handle {
    /// Requests cancellation. Returns `true` iff this call moved the
    /// task to cancelled; a running task cannot be preempted, so a
    /// cancel from another thread blocks until the closure finishes
    /// and then returns `false`.
    ///
    /// Re-raises the stored panic when the task panicked.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    /// Requests that the task run again, with its due time refreshed
    /// to `now() + delay`. Accepted while the task is waiting or
    /// running (a running task reruns after the closure completes).
    ///
    /// Re-raises the stored panic when the task panicked.
    pub fn restart(&self) -> bool {
        self.task.restart()
    }

    pub fn is_waiting(&self) -> bool {
        self.task.is_waiting()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// Whether the closure completed normally. Re-raises the stored
    /// panic when the task panicked.
    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// The fixed delay this task was created with.
    pub fn delay(&self) -> Duration {
        self.task.delay()
    }

    /// Consumes the handle without cancelling the task.
    pub fn detach(mut self) {
        self.cancel_on_drop = false;
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        // a panicked task would re-raise out of this drop; leave it in
        // the panicked state instead
        if self.cancel_on_drop && !self.task.is_panicked() {
            self.task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::Exclusive;
    use crate::testkit::eventually;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn a_task_progresses_from_waiting_through_running_to_done() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let handle = timer.add_delayed_task(Duration::from_millis(300), || {
            thread::sleep(Duration::from_millis(200));
        });

        assert_eq!(handle.delay(), Duration::from_millis(300));

        thread::sleep(Duration::from_millis(100));
        assert!(handle.is_waiting());

        eventually(Duration::from_secs(3), || handle.is_running());
        eventually(Duration::from_secs(3), || handle.is_done());
    }

    #[test]
    fn execution_never_begins_before_the_delay_has_elapsed() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let started_at = Arc::new(Exclusive::new(None));
        let created_at = Instant::now();

        let handle = {
            let started_at = started_at.clone();

            timer.add_delayed_task(Duration::from_millis(200), move || {
                *started_at.lock() = Some(Instant::now());
            })
        };

        eventually(Duration::from_secs(3), || handle.is_done());

        let started_at = started_at.with(|s| s.take()).expect("closure ran");
        assert!(started_at - created_at >= Duration::from_millis(200));
    }

    #[test]
    fn cancelling_a_waiting_task_prevents_execution() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let ran = Arc::new(AtomicUsize::new(0));

        let handle = {
            let ran = ran.clone();

            timer.add_delayed_task(Duration::from_millis(300), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(handle.cancel());
        assert!(handle.is_cancelled());

        thread::sleep(Duration::from_millis(500));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelling_a_running_task_blocks_and_reports_the_true_outcome() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let handle = timer.add_delayed_task(Duration::from_millis(0), || {
            thread::sleep(Duration::from_millis(500));
        });

        eventually(Duration::from_secs(3), || handle.is_running());

        let cancel_started = Instant::now();
        assert!(!handle.cancel());
        assert!(cancel_started.elapsed() >= Duration::from_millis(200));

        assert!(handle.is_done());
    }

    #[test]
    fn restarting_a_waiting_task_postpones_execution() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let started_at = Arc::new(Exclusive::new(None));
        let created_at = Instant::now();

        let handle = {
            let started_at = started_at.clone();

            timer.add_delayed_task(Duration::from_millis(400), move || {
                *started_at.lock() = Some(Instant::now());
            })
        };

        thread::sleep(Duration::from_millis(200));
        assert!(handle.restart());

        eventually(Duration::from_secs(3), || handle.is_done());

        // rescheduled at restart time, so roughly 200ms + 400ms in
        let started_at = started_at.with(|s| s.take()).expect("closure ran");
        assert!(started_at - created_at >= Duration::from_millis(500));
    }

    #[test]
    fn restarting_a_running_task_runs_it_again() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let runs = Arc::new(AtomicUsize::new(0));

        let handle = {
            let runs = runs.clone();

            timer.add_delayed_task(Duration::from_millis(0), move || {
                runs.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(150));
            })
        };

        eventually(Duration::from_secs(3), || handle.is_running());
        assert!(handle.restart());

        eventually(Duration::from_secs(3), || {
            runs.load(Ordering::SeqCst) == 2
        });
        eventually(Duration::from_secs(3), || handle.is_done());
    }

    #[test]
    fn a_full_queue_cancels_the_task_so_the_handle_sees_it() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 1);

        let occupant = timer.add_delayed_task(Duration::from_secs(30), || ());
        let rejected = timer.add_delayed_task(Duration::from_secs(30), || ());

        assert!(occupant.is_waiting());
        assert!(rejected.is_cancelled());
    }

    #[test]
    fn dropping_the_handle_cancels_the_task() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = ran.clone();

            let _ = timer.add_delayed_task(Duration::from_millis(150), move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        thread::sleep(Duration::from_millis(400));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_detached_task_still_runs() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = ran.clone();

            timer
                .add_delayed_task(Duration::from_millis(100), move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .detach();
        }

        eventually(Duration::from_secs(3), || ran.load(Ordering::SeqCst) == 1);
    }

    #[test]
    fn dropping_the_timer_cancels_pending_tasks() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let handle = timer.add_delayed_task(Duration::from_secs(30), || ());

        drop(timer);

        assert!(handle.is_cancelled());
        assert!(!handle.restart());
    }

    #[test]
    fn a_pool_gone_before_the_timer_means_due_tasks_are_cancelled() {
        let pool = ThreadPool::new(1);
        let timer = Timer::new(&pool, 16);

        drop(pool);

        let handle = timer.add_delayed_task(Duration::from_millis(30), || ());

        eventually(Duration::from_secs(3), || handle.is_cancelled());
    }

    #[test]
    fn a_panicking_task_reraises_when_observed() {
        let pool = ThreadPool::new(2);
        let timer = Timer::new(&pool, 16);

        let handle = timer.add_delayed_task(Duration::from_millis(30), || panic!("boom"));

        eventually(Duration::from_secs(3), || {
            !handle.is_waiting() && !handle.is_running()
        });

        let observed = panic::catch_unwind(AssertUnwindSafe(|| handle.is_done()));
        let payload = observed.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<String>().map(String::as_str),
            Some("boom")
        );

        assert!(!handle.is_cancelled());
        handle.detach();
    }
}
