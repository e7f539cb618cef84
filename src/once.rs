//! At-most-once initialization of a shared value.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::util::Deferred;

const EMPTY: u8 = 0b000;
const BUSY: u8 = 0b001;
const READY: u8 = 0b010;
const DISABLED: u8 = 0b100;

/// A cell that can be initialized at most once and read without
/// locking afterwards.
///
/// The first call to [`Once::set`] or [`Once::set_with`] wins; every
/// later attempt reports `false` and leaves the stored value alone.
/// [`Once::disable`] additionally forbids any future initialization,
/// which is useful at shutdown: late writers find the door closed
/// instead of racing the teardown.
///
/// ```
/// use encore::once::Once;
///
/// let port = Once::new();
///
/// assert!(port.set(8080));
/// assert!(!port.set(9090));
/// assert_eq!(port.get(), Some(&8080));
/// ```
pub struct Once<T> {
    flags: AtomicU8,
    slot: UnsafeCell<Option<T>>,
}

// The slot is written exactly once, by the thread that won the
// EMPTY -> BUSY transition, and only read after READY is published.
unsafe impl<T: Send> Send for Once<T> {}
unsafe impl<T: Send + Sync> Sync for Once<T> {}

impl<T> Once<T> {
    pub fn new() -> Self {
        Self {
            flags: AtomicU8::new(EMPTY),
            slot: UnsafeCell::new(None),
        }
    }

    /// Stores `value` if the cell is still empty and enabled.
    /// Returns whether the value was stored.
    pub fn set(&self, value: T) -> bool {
        self.set_with(|| value)
    }

    /// Stores the result of `init` if the cell is still empty and
    /// enabled. `init` runs only when this caller won the slot; if it
    /// panics, the cell reverts to empty and the panic propagates.
    pub fn set_with(&self, init: impl FnOnce() -> T) -> bool {
        if self
            .flags
            .compare_exchange(EMPTY, BUSY, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let rollback = Deferred::new(|| self.flags.store(EMPTY, Ordering::Release));
        let value = init();
        rollback.disarm();

        unsafe {
            *self.slot.get() = Some(value);
        }
        self.flags.store(READY, Ordering::Release);
        true
    }

    /// Reads the stored value, or `None` when nothing has been stored.
    /// An initialization in flight on another thread is waited out.
    pub fn get(&self) -> Option<&T> {
        loop {
            let flags = self.flags.load(Ordering::Acquire);

            if flags & BUSY != 0 {
                std::hint::spin_loop();
                continue;
            }

            return if flags & READY != 0 {
                unsafe { (*self.slot.get()).as_ref() }
            } else {
                None
            };
        }
    }

    /// Forbids future initialization and returns the current value.
    pub fn disable(&self) -> Option<&T> {
        loop {
            let flags = self.flags.load(Ordering::Acquire);

            if flags & BUSY != 0 {
                std::hint::spin_loop();
                continue;
            }

            if flags & DISABLED != 0
                || self
                    .flags
                    .compare_exchange(
                        flags,
                        flags | DISABLED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                return self.get();
            }
        }
    }

    /// Consumes the cell and returns the stored value, if any.
    pub fn into_inner(self) -> Option<T> {
        self.slot.into_inner()
    }
}

impl<T> Default for Once<T> {
    fn default() -> Self {
        Self::new()
    }
}
