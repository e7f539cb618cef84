use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::guard::Signaled;
use crate::util::Deferred;

use super::TimerCore;

/// The work carried by a delayed task. `Fn` rather than `FnOnce`: a
/// restarted task runs its closure again.
pub(crate) type TaskFn = Box<dyn Fn() + Send + Sync + 'static>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Where a delayed task is in its life.
///
/// Transitions are only ever made under the task's state lock, so each
/// observer sees a single coherent variant. Every exit from `Running`
/// wakes the state condition, which is what a cross-thread cancel
/// blocks on.
pub(crate) enum TaskState {
    /// Enqueued (or about to be), not yet handed to a worker.
    Waiting,
    /// A worker is executing the closure right now.
    Running {
        executor: ThreadId,
        restart_wanted: bool,
    },
    /// The closure completed normally.
    Done,
    /// The closure panicked; observing the task re-raises the message.
    Panicked { message: String },
    /// Cancelled before completion (or after it, see `cancel`).
    Cancelled,
}

/// A user closure paired with a fixed delay and the state machine that
/// arbitrates between the worker running it, the timer queue holding
/// it, and the handle controlling it. All of those share ownership of
/// the same allocation.
pub(crate) struct DelayedTask {
    id: u64,
    delay: Duration,
    work: TaskFn,
    state: Signaled<TaskState>,
    timer: Weak<TimerCore>,
    // self-reference handed back to the queue when a completed task
    // restarts
    me: Weak<DelayedTask>,
}

impl DelayedTask {
    pub(crate) fn new(delay: Duration, work: TaskFn, timer: Weak<TimerCore>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            delay,
            work,
            state: Signaled::new(TaskState::Waiting),
            timer,
            me: me.clone(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    /// The instant this task becomes eligible to run, evaluated
    /// against the current clock. The delay is fixed at creation but
    /// each scheduling attempt reads the clock afresh, which is what
    /// gives restart its `now() + delay` semantics.
    pub(crate) fn due_time(&self) -> Instant {
        Instant::now() + self.delay
    }

    /// Requests cancellation. Returns `true` iff this call performed
    /// the transition to `Cancelled`.
    ///
    /// A running task cannot be preempted: cancelling from a thread
    /// other than the executing worker blocks until the task leaves
    /// `Running` and then reports `false`, letting the caller observe
    /// the true outcome. The executing thread itself may cancel
    /// synchronously from inside the closure.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock();

        match &*state {
            TaskState::Waiting | TaskState::Done => {
                *state = TaskState::Cancelled;
                true
            }

            TaskState::Running { executor, .. } if *executor == thread::current().id() => {
                *state = TaskState::Cancelled;
                true
            }

            TaskState::Running { .. } => {
                state.wait(|s| !matches!(s, TaskState::Running { .. }));
                false
            }

            TaskState::Panicked { message } => rethrow(message),

            TaskState::Cancelled => false,
        }
    }

    /// Requests that the task run again. From `Waiting` the queue
    /// entry is moved to a fresh due time; from `Running` the rerun is
    /// deferred until the closure completes. Returns whether the
    /// request was accepted.
    pub(crate) fn restart(&self) -> bool {
        let mut state = self.state.lock();

        match &mut *state {
            TaskState::Waiting => {
                let rescheduled = self
                    .timer
                    .upgrade()
                    .map_or(false, |timer| timer.requeue(self));

                if !rescheduled {
                    *state = TaskState::Cancelled;
                }

                true
            }

            TaskState::Running { restart_wanted, .. } => {
                *restart_wanted = true;
                true
            }

            TaskState::Panicked { message } => rethrow(message),

            TaskState::Done | TaskState::Cancelled => false,
        }
    }

    /// Executes the closure on the calling thread. A no-op unless the
    /// task is `Waiting`.
    pub(crate) fn run(&self) {
        {
            let mut state = self.state.lock();

            match &*state {
                TaskState::Waiting => {
                    *state = TaskState::Running {
                        executor: thread::current().id(),
                        restart_wanted: false,
                    };
                }

                _ => return,
            }
        }

        // cancellers blocked on the state condition must wake no
        // matter which path this function leaves through
        let _wake = Deferred::new(|| self.state.notify_all());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.work)()));

        let mut state = self.state.lock();

        match outcome {
            Err(payload) => {
                if let TaskState::Running { .. } = &*state {
                    *state = TaskState::Panicked {
                        message: panic_message(payload.as_ref()),
                    };
                }
            }

            Ok(()) => match &*state {
                TaskState::Running {
                    restart_wanted: true,
                    ..
                } => {
                    *state = TaskState::Waiting;

                    let requeued = match (self.timer.upgrade(), self.me.upgrade()) {
                        (Some(timer), Some(me)) => timer.enqueue(&me),
                        _ => false,
                    };

                    if !requeued {
                        *state = TaskState::Cancelled;
                    }
                }

                TaskState::Running { .. } => *state = TaskState::Done,

                // a task cancelled from inside its own closure stays
                // cancelled
                _ => {}
            },
        }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        matches!(&*self.state.lock(), TaskState::Waiting)
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(&*self.state.lock(), TaskState::Running { .. })
    }

    /// Whether the closure completed normally. Re-raises the stored
    /// panic when the task is `Panicked`.
    pub(crate) fn is_done(&self) -> bool {
        match &*self.state.lock() {
            TaskState::Done => true,
            TaskState::Panicked { message } => rethrow(message),
            _ => false,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(&*self.state.lock(), TaskState::Cancelled)
    }

    /// Non-raising probe for the panicked state, so a handle being
    /// dropped can avoid panicking out of its own destructor.
    pub(crate) fn is_panicked(&self) -> bool {
        matches!(&*self.state.lock(), TaskState::Panicked { .. })
    }
}

fn rethrow(message: &str) -> ! {
    panic::panic_any(message.to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "delayed task panicked".to_string()
    }
}
