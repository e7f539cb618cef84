use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::guard::Signaled;

use super::task::DelayedTask;

/// Time-ordered set of pending delayed tasks.
///
/// Tasks are keyed by `(due_time, seq)`, where `seq` is a
/// per-insertion counter: tasks due at the same instant leave the
/// queue in insertion order. An auxiliary index from task id to key
/// keeps reschedule at O(log n). For every queued task there is
/// exactly one entry in each map, with the identical key.
pub(crate) struct TimerQueue {
    state: Signaled<QueueState>,
}

type QueueKey = (Instant, u64);

struct QueueState {
    quit: bool,
    max_size: usize,
    next_seq: u64,
    ordered: BTreeMap<QueueKey, Arc<DelayedTask>>,
    index: HashMap<u64, QueueKey>,
}

impl QueueState {
    /// Inserts at the given due time, reporting whether the task
    /// became the earliest one (so the caller knows to wake the
    /// dispatcher).
    fn place(&mut self, due: Instant, task: Arc<DelayedTask>) -> bool {
        let key = (due, self.next_seq);
        self.next_seq += 1;

        self.index.insert(task.id(), key);
        self.ordered.insert(key, task);

        self.ordered.keys().next() == Some(&key)
    }

    fn earliest(&self) -> Option<Instant> {
        self.ordered.keys().next().map(|(due, _)| *due)
    }

    fn ready(&self) -> bool {
        matches!(self.earliest(), Some(due) if due <= Instant::now())
    }

    fn pop_ready(&mut self) -> Option<Arc<DelayedTask>> {
        if !self.ready() {
            return None;
        }

        let key = *self.ordered.keys().next()?;
        let task = self.ordered.remove(&key)?;
        self.index.remove(&task.id());

        Some(task)
    }
}

impl TimerQueue {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            state: Signaled::new(QueueState {
                quit: false,
                max_size,
                next_seq: 0,
                ordered: BTreeMap::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Enqueues a task at `now() + delay`. Rejects when shutting
    /// down, full, or already enqueued.
    pub(crate) fn add(&self, task: &Arc<DelayedTask>) -> bool {
        let became_earliest = {
            let mut queue = self.state.lock();

            if queue.quit || queue.ordered.len() >= queue.max_size {
                return false;
            }

            if queue.index.contains_key(&task.id()) {
                return false;
            }

            queue.place(task.due_time(), task.clone())
        };

        if became_earliest {
            self.state.notify_one();
        }

        true
    }

    /// Moves an enqueued task to a fresh `now() + delay` position.
    /// Rejects when shutting down or when the task is not enqueued
    /// (it may already be on its way to a worker).
    pub(crate) fn reschedule(&self, task: &DelayedTask) -> bool {
        let became_earliest = {
            let mut queue = self.state.lock();

            if queue.quit {
                return false;
            }

            let old_key = match queue.index.get(&task.id()) {
                Some(key) => *key,
                None => return false,
            };

            let queued = match queue.ordered.remove(&old_key) {
                Some(queued) => queued,
                None => return false,
            };

            queue.place(task.due_time(), queued)
        };

        if became_earliest {
            self.state.notify_one();
        }

        true
    }

    /// Dispatcher-side blocking pop: returns the earliest task once
    /// its due time has arrived (due equal to now counts as ready),
    /// waiting with the due time as deadline -- or indefinitely while
    /// empty. Returns `None` once stopped.
    pub(crate) fn get(&self) -> Option<Arc<DelayedTask>> {
        let mut queue = self.state.lock();

        loop {
            if queue.quit {
                return None;
            }

            if let Some(task) = queue.pop_ready() {
                return Some(task);
            }

            match queue.earliest() {
                Some(due) => {
                    // the earliest-changed clause lets a newly added
                    // task with a nearer due time shorten the sleep
                    queue.wait_until(due, |q| {
                        q.quit || q.ready() || q.earliest() != Some(due)
                    });
                }

                None => {
                    queue.wait(|q| q.quit || !q.ordered.is_empty());
                }
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.state.with(|queue| queue.quit = true);
        self.state.notify_one();
    }

    /// Removes and returns every remaining task, so the caller can
    /// cancel them without holding the queue lock.
    pub(crate) fn drain(&self) -> Vec<Arc<DelayedTask>> {
        self.state.with(|queue| {
            queue.index.clear();

            std::mem::take(&mut queue.ordered)
                .into_iter()
                .map(|(_, task)| task)
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::task::DelayedTask;
    use std::sync::Weak;
    use std::thread;
    use std::time::{Duration, Instant};

    fn task(delay: Duration) -> Arc<DelayedTask> {
        DelayedTask::new(delay, Box::new(|| ()), Weak::new())
    }

    #[test]
    fn both_maps_hold_exactly_one_matching_entry_per_task() {
        let queue = TimerQueue::new(8);

        let tasks: Vec<_> = (0..3).map(|_| task(Duration::from_secs(1))).collect();

        for t in &tasks {
            assert!(queue.add(t));
        }

        queue.state.with(|q| {
            assert_eq!(q.ordered.len(), 3);
            assert_eq!(q.index.len(), 3);

            for (key, queued) in &q.ordered {
                assert_eq!(q.index.get(&queued.id()), Some(key));
            }
        });
    }

    #[test]
    fn full_queue_rejects_additions() {
        let queue = TimerQueue::new(2);

        assert!(queue.add(&task(Duration::from_secs(1))));
        assert!(queue.add(&task(Duration::from_secs(1))));
        assert!(!queue.add(&task(Duration::from_secs(1))));
    }

    #[test]
    fn a_task_cannot_be_enqueued_twice() {
        let queue = TimerQueue::new(8);
        let t = task(Duration::from_secs(1));

        assert!(queue.add(&t));
        assert!(!queue.add(&t));
    }

    #[test]
    fn identical_due_times_leave_in_insertion_order() {
        let queue = TimerQueue::new(8);

        let first = task(Duration::from_millis(0));
        let second = task(Duration::from_millis(0));

        let due = Instant::now() + Duration::from_millis(30);

        queue.state.with(|q| {
            q.place(due, first.clone());
            q.place(due, second.clone());
        });

        let popped = queue.get().expect("queue should produce the first task");
        assert_eq!(popped.id(), first.id());

        let popped = queue.get().expect("queue should produce the second task");
        assert_eq!(popped.id(), second.id());
    }

    #[test]
    fn get_blocks_until_the_due_time() {
        let queue = TimerQueue::new(8);

        let started = Instant::now();
        assert!(queue.add(&task(Duration::from_millis(100))));

        assert!(queue.get().is_some());
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn an_earlier_task_wakes_a_blocked_get() {
        let queue = Arc::new(TimerQueue::new(8));

        assert!(queue.add(&task(Duration::from_secs(60))));

        let getter = {
            let queue = queue.clone();
            thread::spawn(move || queue.get())
        };

        thread::sleep(Duration::from_millis(50));

        let urgent = task(Duration::from_millis(20));
        assert!(queue.add(&urgent));

        let popped = getter.join().unwrap().expect("urgent task expected");
        assert_eq!(popped.id(), urgent.id());
    }

    #[test]
    fn reschedule_requires_an_enqueued_task() {
        let queue = TimerQueue::new(8);

        let queued = task(Duration::from_secs(1));
        let stranger = task(Duration::from_secs(1));

        assert!(queue.add(&queued));
        assert!(queue.reschedule(&queued));
        assert!(!queue.reschedule(&stranger));

        queue.state.with(|q| {
            assert_eq!(q.ordered.len(), 1);
            assert_eq!(q.index.len(), 1);
        });
    }

    #[test]
    fn stop_unblocks_and_rejects() {
        let queue = Arc::new(TimerQueue::new(8));

        let getter = {
            let queue = queue.clone();
            thread::spawn(move || queue.get())
        };

        thread::sleep(Duration::from_millis(50));
        queue.stop();

        assert!(getter.join().unwrap().is_none());
        assert!(!queue.add(&task(Duration::from_millis(1))));
        assert!(!queue.reschedule(&task(Duration::from_millis(1))));
    }

    #[test]
    fn drain_empties_the_queue() {
        let queue = TimerQueue::new(8);

        for _ in 0..3 {
            assert!(queue.add(&task(Duration::from_secs(1))));
        }

        assert_eq!(queue.drain().len(), 3);
        queue.state.with(|q| {
            assert!(q.ordered.is_empty());
            assert!(q.index.is_empty());
        });
    }
}
