//! Helpers for asserting on behavior that settles asynchronously.

use std::thread;
use std::time::{Duration, Instant};

/// Re-evaluates `condition` every few milliseconds until it returns
/// true, panicking (and thus failing the enclosing test) once `limit`
/// elapses first.
///
/// Useful for observing work performed by other threads in a polling
/// fashion, without baking fragile sleeps into tests.
pub fn eventually<F: FnMut() -> bool>(limit: Duration, mut condition: F) {
    let started = Instant::now();

    while !condition() {
        if started.elapsed() > limit {
            panic!("condition not satisfied within {:?}", limit);
        }

        thread::sleep(Duration::from_millis(10));
    }
}
