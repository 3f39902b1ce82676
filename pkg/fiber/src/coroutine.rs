//! Coroutine descriptors, the per-scheduler descriptor pool, and the hybrid
//! waiter record shared with the synchronization primitives.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::context::Context;
use crate::timer::TimerId;

pub(crate) type TaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a coroutine, valid on any thread.
///
/// The scheduler id lives in the high 32 bits and the descriptor slot in the
/// low 32 bits. Obtained from [`crate::coroutine()`]; consumed by
/// [`crate::resume()`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CoroutineHandle(u64);

impl CoroutineHandle {
    pub(crate) fn new(sched_id: u32, co_id: u32) -> Self {
        CoroutineHandle(((sched_id as u64) << 32) | co_id as u64)
    }

    pub(crate) fn sched_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn co_id(self) -> u32 {
        self.0 as u32
    }

    /// The raw 64-bit id.
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Waitx states. A record moves from `WAIT` to exactly one of the other two,
/// by compare-and-swap; the winner owns the wakeup.
pub(crate) const ST_WAIT: u8 = 0;
pub(crate) const ST_READY: u8 = 1;
pub(crate) const ST_TIMEOUT: u8 = 2;

/// State cell of one pending blocking operation, shared between the waiter
/// and whichever party will wake it (signaler, producer/consumer, or the
/// timer expirer). Primitive-specific payload lives alongside the `Arc` in
/// the owning primitive's wait queue.
pub(crate) struct Waitx {
    state: AtomicU8,
}

impl Waitx {
    pub fn new() -> Arc<Waitx> {
        Arc::new(Waitx {
            state: AtomicU8::new(ST_WAIT),
        })
    }

    /// `WAIT -> READY`; true if this caller won the wakeup.
    pub fn try_ready(&self) -> bool {
        self.state
            .compare_exchange(ST_WAIT, ST_READY, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// `WAIT -> TIMEOUT`; true if this caller won the wakeup.
    pub fn try_timeout(&self) -> bool {
        self.state
            .compare_exchange(ST_WAIT, ST_TIMEOUT, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Relaxed)
    }
}

/// A coroutine descriptor. Owned by exactly one scheduler for its lifetime
/// and only ever mutated on that scheduler's thread.
pub(crate) struct Coroutine {
    pub id: u32,
    /// Saved machine context; `None` until the first suspension.
    pub ctx: Option<Context>,
    /// Index of the stack slot this coroutine runs on (`id & (stack_num-1)`).
    pub stack_idx: usize,
    /// Saved live stack region, filled when the stack slot is re-assigned.
    pub buf: Vec<u8>,
    /// Closure for the first run.
    pub cb: Option<TaskFn>,
    /// Pending blocking operation, if suspended on a primitive.
    pub waitx: Option<Arc<Waitx>>,
    /// Handle into the timer manager, if a timer is armed.
    pub timer: Option<TimerId>,
}

/// Slab of coroutine descriptors keyed by small integer ids. Id 0 is
/// reserved for the scheduler's own main context.
pub(crate) struct CoroutinePool {
    slots: Vec<Box<Coroutine>>,
    free: Vec<u32>,
    stack_mask: u32,
}

impl CoroutinePool {
    pub fn new(stack_num: u32) -> Self {
        debug_assert!(stack_num.is_power_of_two());
        let mut pool = CoroutinePool {
            slots: Vec::with_capacity(64),
            free: Vec::new(),
            stack_mask: stack_num - 1,
        };
        // Slot 0: the scheduler's main context. Always has a live Context so
        // resume() can save into it unconditionally.
        pool.slots.push(Box::new(Coroutine {
            id: 0,
            ctx: Some(Context::default()),
            stack_idx: 0,
            buf: Vec::new(),
            cb: None,
            waitx: None,
            timer: None,
        }));
        pool
    }

    /// Pops a free descriptor (or grows the slab) and binds the closure.
    pub fn alloc(&mut self, cb: TaskFn) -> u32 {
        match self.free.pop() {
            Some(id) => {
                let co = &mut self.slots[id as usize];
                debug_assert!(co.ctx.is_none() && co.cb.is_none());
                co.cb = Some(cb);
                id
            }
            None => {
                let id = self.slots.len() as u32;
                self.slots.push(Box::new(Coroutine {
                    id,
                    ctx: None,
                    stack_idx: (id & self.stack_mask) as usize,
                    buf: Vec::new(),
                    cb: Some(cb),
                    waitx: None,
                    timer: None,
                }));
                id
            }
        }
    }

    /// Returns a terminated descriptor to the free list.
    pub fn recycle(&mut self, id: u32) {
        debug_assert_ne!(id, 0);
        let co = &mut self.slots[id as usize];
        co.ctx = None;
        co.cb = None;
        co.waitx = None;
        co.timer = None;
        co.buf.clear(); // keep the capacity for the next occupant
        self.free.push(id);
    }

    pub fn get(&self, id: u32) -> &Coroutine {
        &self.slots[id as usize]
    }

    pub fn get_mut(&mut self, id: u32) -> &mut Coroutine {
        &mut self.slots[id as usize]
    }

    /// Raw pointer to a descriptor; stable across slab growth since entries
    /// are boxed.
    pub fn raw(&mut self, id: u32) -> *mut Coroutine {
        &mut **self.slots.get_mut(id as usize).unwrap()
    }

    /// The main context switched away from when a coroutine is resumed.
    pub fn main_ctx(&mut self) -> *mut Context {
        self.slots[0].ctx.as_mut().unwrap()
    }
}
