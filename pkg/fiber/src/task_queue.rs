//! Per-scheduler inbound mailbox.
//!
//! Other threads drop new-task closures and ready-coroutine ids here; the
//! owning scheduler drains both queues in bulk, under a single critical
//! section, once per loop iteration.

use parking_lot::Mutex;

use crate::coroutine::TaskFn;

pub(crate) struct TaskQueue {
    inner: Mutex<Queues>,
}

struct Queues {
    new_tasks: Vec<TaskFn>,
    ready_tasks: Vec<u32>,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue {
            inner: Mutex::new(Queues {
                new_tasks: Vec::new(),
                ready_tasks: Vec::new(),
            }),
        }
    }

    pub fn add_new_task(&self, cb: TaskFn) {
        self.inner.lock().new_tasks.push(cb);
    }

    pub fn add_ready_task(&self, co_id: u32) {
        self.inner.lock().ready_tasks.push(co_id);
    }

    /// Swaps the queued work into the caller's (empty) buffers. The buffers'
    /// capacity is handed back to the queue, so steady-state drains do not
    /// allocate.
    pub fn drain(&self, new_tasks: &mut Vec<TaskFn>, ready_tasks: &mut Vec<u32>) {
        debug_assert!(new_tasks.is_empty() && ready_tasks.is_empty());
        let mut q = self.inner.lock();
        std::mem::swap(&mut q.new_tasks, new_tasks);
        std::mem::swap(&mut q.ready_tasks, ready_tasks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn drains_in_fifo_order() {
        let q = TaskQueue::new();
        let hits = Arc::new(AtomicU32::new(0));
        for i in 0..3u32 {
            let hits = hits.clone();
            q.add_new_task(Box::new(move || {
                // Each closure asserts it runs in submission order.
                assert_eq!(hits.fetch_add(1, Ordering::Relaxed), i);
            }));
            q.add_ready_task(i + 10);
        }

        let mut new_tasks = Vec::new();
        let mut ready = Vec::new();
        q.drain(&mut new_tasks, &mut ready);
        assert_eq!(ready, vec![10, 11, 12]);
        for cb in new_tasks.drain(..) {
            cb();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 3);

        // The queue is now empty.
        q.drain(&mut new_tasks, &mut ready);
        assert!(new_tasks.is_empty() && ready.is_empty());
    }
}
