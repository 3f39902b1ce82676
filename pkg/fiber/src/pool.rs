//! Per-scheduler object pool.
//!
//! Each scheduler gets its own free-list vector, addressed without locking:
//! `pop` and `push` must be called from a coroutine and only ever touch the
//! caller's scheduler-local vector. Clones share the same pool.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::scheduler::{self, sched_id, scheds};
use crate::sync::WaitGroup;

type CreateFn<T> = Box<dyn Fn() -> T + Send + Sync>;
type DestroyFn<T> = Box<dyn Fn(T) + Send + Sync>;

struct PoolInner<T> {
    pools: Box<[UnsafeCell<Vec<T>>]>,
    maxcap: usize,
    ccb: Option<CreateFn<T>>,
    dcb: Option<DestroyFn<T>>,
}

// Each element vector is only accessed by its scheduler's thread (or, in
// clear()/drop with the runtime inactive, by a single caller).
unsafe impl<T: Send> Send for PoolInner<T> {}
unsafe impl<T: Send> Sync for PoolInner<T> {}

pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn new() -> Self {
        Self::build(None, None, usize::MAX)
    }

    /// A pool that creates elements on demand with `ccb`, destroys overflow
    /// and cleared elements with `dcb`, and caps each scheduler-local vector
    /// at `cap` elements.
    pub fn with_callbacks<C, D>(ccb: C, dcb: D, cap: usize) -> Self
    where
        C: Fn() -> T + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(ccb)), Some(Box::new(dcb)), cap)
    }

    fn build(ccb: Option<CreateFn<T>>, dcb: Option<DestroyFn<T>>, cap: usize) -> Self {
        let n = scheduler::sched_num();
        let pools = (0..n)
            .map(|_| UnsafeCell::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Pool {
            inner: Arc::new(PoolInner {
                pools,
                maxcap: cap,
                ccb,
                dcb,
            }),
        }
    }

    fn local(&self) -> &mut Vec<T> {
        let id = sched_id().expect("pool must be used from a coroutine");
        assert!(
            scheduler::coroutine().is_some(),
            "pool must be used from a coroutine"
        );
        unsafe { &mut *self.inner.pools[id].get() }
    }

    /// Takes an element from the caller's scheduler-local vector, falling
    /// back to the creation callback. Must be called from a coroutine.
    pub fn pop(&self) -> Option<T> {
        let v = self.local();
        v.pop().or_else(|| self.inner.ccb.as_ref().map(|c| c()))
    }

    /// Returns an element to the caller's scheduler-local vector; elements
    /// over the capacity cap go to the destruction callback instead. Must be
    /// called from a coroutine.
    pub fn push(&self, value: T) {
        let v = self.local();
        if v.len() < self.inner.maxcap || self.inner.dcb.is_none() {
            v.push(value);
        } else {
            (self.inner.dcb.as_ref().unwrap())(value);
        }
    }

    /// Number of elements in the caller's scheduler-local vector. Must be
    /// called from a coroutine.
    pub fn len(&self) -> usize {
        self.local().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties every scheduler-local vector. With the runtime active, one
    /// coroutine is fanned out per scheduler so each vector is drained under
    /// its owner; blocks until all of them are done.
    pub fn clear(&self) {
        if scheduler::is_active() {
            let scheds = scheds();
            let wg = WaitGroup::new(scheds.len() as u32);
            for s in scheds {
                let pool = self.clone();
                let wg = wg.clone();
                s.go(move || {
                    let v = pool.local();
                    if let Some(dcb) = &pool.inner.dcb {
                        for e in v.drain(..) {
                            dcb(e);
                        }
                    } else {
                        v.clear();
                    }
                    wg.done();
                });
            }
            wg.wait();
        } else {
            for cell in self.inner.pools.iter() {
                let v = unsafe { &mut *cell.get() };
                if let Some(dcb) = &self.inner.dcb {
                    for e in v.drain(..) {
                        dcb(e);
                    }
                } else {
                    v.clear();
                }
            }
        }
    }
}

impl<T: Send + 'static> Default for Pool<T> {
    fn default() -> Self {
        Pool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::go;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn pop_creates_and_push_recycles() {
        let made = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let made2 = made.clone();
        go(move || {
            let pool = Pool::with_callbacks(
                move || {
                    made2.fetch_add(1, Ordering::Relaxed);
                    Vec::<u8>::with_capacity(64)
                },
                |_| {},
                8,
            );
            let a = pool.pop().unwrap();
            pool.push(a);
            let _b = pool.pop().unwrap(); // recycled, not re-created
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();
        assert_eq!(made.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn capacity_cap_destroys_overflow() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let destroyed2 = destroyed.clone();
        go(move || {
            let d = destroyed2.clone();
            let pool = Pool::with_callbacks(|| 0u32, move |_| {
                d.fetch_add(1, Ordering::Relaxed);
            }, 2);
            for i in 0..4 {
                pool.push(i);
            }
            tx.send(pool.len()).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 2);
        assert_eq!(destroyed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn without_callbacks_pop_is_none() {
        let (tx, rx) = mpsc::channel();
        go(move || {
            let pool = Pool::<u32>::new();
            tx.send(pool.pop()).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn clear_drains_every_scheduler() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = Pool::with_callbacks(|| 0u32, {
            let destroyed = destroyed.clone();
            move |_| {
                destroyed.fetch_add(1, Ordering::Relaxed);
            }
        }, usize::MAX);

        // Seed one element on every scheduler.
        let wg = WaitGroup::new(scheds().len() as u32);
        for s in scheds() {
            let pool = pool.clone();
            let wg = wg.clone();
            s.go(move || {
                pool.push(1);
                wg.done();
            });
        }
        wg.wait();

        pool.clear();
        assert_eq!(destroyed.load(Ordering::Relaxed), scheds().len());
    }

    #[test]
    #[should_panic(expected = "must be used from a coroutine")]
    fn pool_off_coroutine_is_misuse() {
        let pool = Pool::<u32>::new();
        let _ = pool.pop();
    }
}
