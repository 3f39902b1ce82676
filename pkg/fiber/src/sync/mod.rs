//! Coroutine-aware synchronization primitives.
//!
//! Waiters may be coroutines (resumed through their scheduler's mailbox) or
//! plain OS threads (blocked on a condition variable); every primitive
//! handles both.

mod event;
mod mutex;

pub use event::{Event, SyncEvent, WaitGroup};
pub use mutex::{Mutex, MutexGuard};
