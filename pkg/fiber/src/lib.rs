//! A multi-threaded M:N stackful coroutine runtime.
//!
//! A fixed set of cooperative schedulers (one per CPU by default), each
//! pinned to an OS thread, runs user closures as coroutines with their own
//! saved stacks. Schedulers integrate I/O readiness (epoll/kqueue) and timer
//! expirations into a single wait, and the synchronization primitives accept
//! both coroutines and plain OS threads as waiters.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let wg = fiber::WaitGroup::new(2);
//! for i in 0..2u64 {
//!     let wg = wg.clone();
//!     fiber::go(move || {
//!         fiber::sleep(Duration::from_millis(i));
//!         wg.done();
//!     });
//! }
//! wg.wait();
//! ```

mod chan;
mod config;
mod context;
mod coroutine;
mod error;
mod pool;
mod poller;
mod scheduler;
mod stack;
mod sync;
mod task_queue;
mod time;
mod timer;

pub use chan::Chan;
pub use config::{set_sched_num, set_stack_num, set_stack_size};
pub use coroutine::CoroutineHandle;
pub use error::{Error, Result};
pub use pool::Pool;
pub use poller::Dir;
pub use scheduler::{
    add_io_event, add_timer, coroutine, coroutine_id, del_io_event, del_io_events, go, go_on,
    main_sched, next_sched, on_stack, resume, sched, sched_id, sched_num, scheds, sleep,
    stop_scheds, timeout, yield_now, MainSched, Scheduler,
};
pub use sync::{Event, Mutex, MutexGuard, SyncEvent, WaitGroup};
pub use time::{now_ms, now_us};
