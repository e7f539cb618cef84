//! Common types necessary for most applications

pub use log::{debug, error, info, trace, warn};

pub use crate::guard::{lock_all, DeadlockWouldOccur, Exclusive, Recursive, Shared, Signaled};
pub use crate::once::Once;
pub use crate::pool::ThreadPool;
pub use crate::timer::{Handle, Timer};
pub use crate::util::Deferred;
