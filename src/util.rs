/// Runs a callback when dropped, unless it has been disarmed.
///
/// This is the building block for "whatever happens, do this on the way
/// out" cleanup: notifying condition waiters on every exit path, or
/// rolling back a partially performed initialization when the
/// initializer panics.
pub struct Deferred<F: FnOnce()> {
    callback: Option<F>,
}

impl<F: FnOnce()> Deferred<F> {
    pub fn new(callback: F) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    /// Consumes the deferred callback without running it.
    pub fn disarm(mut self) {
        self.callback = None;
    }
}

impl<F: FnOnce()> Drop for Deferred<F> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Deferred;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn runs_on_scope_exit() {
        let done = Arc::new(AtomicBool::new(false));

        {
            let done_clone = done.clone();
            let _deferred = Deferred::new(move || {
                done_clone.store(true, Ordering::SeqCst);
            });

            assert!(!done.load(Ordering::SeqCst));
        }

        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn runs_when_unwinding() {
        let done = Arc::new(AtomicBool::new(false));

        {
            let done = done.clone();

            let _ = thread::spawn(move || {
                let _deferred = Deferred::new(move || {
                    done.store(true, Ordering::SeqCst);
                });

                panic!();
            })
            .join();
        }

        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn disarmed_never_runs() {
        let done = Arc::new(AtomicBool::new(false));

        {
            let done = done.clone();
            let deferred = Deferred::new(move || {
                done.store(true, Ordering::SeqCst);
            });

            deferred.disarm();
        }

        assert!(!done.load(Ordering::SeqCst));
    }
}
