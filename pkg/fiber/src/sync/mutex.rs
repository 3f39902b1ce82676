//! A coroutine-aware mutual-exclusion lock.
//!
//! Not re-entrant. Contended locks hand off in strict FIFO order with no
//! spinning: the unlocker picks the oldest waiter and either posts it to its
//! scheduler's mailbox (coroutine) or signals the condition variable
//! (thread). The lock byte stays held across a coroutine handoff; a thread
//! handoff parks it in a dedicated "released to thread" state so the woken
//! thread can tell its wakeup from a spurious one.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex as OsMutex};

use crate::coroutine::CoroutineHandle;
use crate::scheduler;

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
const LOCKED_FOR_THREAD: u8 = 2;

struct MxState {
    /// FIFO of pending lockers; `None` marks a thread waiter.
    wq: VecDeque<Option<CoroutineHandle>>,
    lock: u8,
}

pub struct Mutex<T: ?Sized> {
    state: OsMutex<MxState>,
    cv: Condvar,
    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Mutex {
            state: OsMutex::new(MxState {
                wq: VecDeque::new(),
                lock: UNLOCKED,
            }),
            cv: Condvar::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, suspending the coroutine (or blocking the thread)
    /// until it is handed over.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        match scheduler::sched() {
            Some(s) if s.running() => {
                let mut st = self.state.lock();
                if st.lock == UNLOCKED {
                    st.lock = LOCKED;
                } else {
                    st.wq.push_back(Some(s.current_handle().unwrap()));
                    drop(st);
                    // The unlocker resumes us with the lock still held on
                    // our behalf.
                    s.yield_current();
                }
            }
            _ => {
                let mut st = self.state.lock();
                if st.lock == UNLOCKED {
                    st.lock = LOCKED;
                } else {
                    st.wq.push_back(None);
                    loop {
                        self.cv.wait(&mut st);
                        if st.lock == LOCKED_FOR_THREAD {
                            st.lock = LOCKED;
                            break;
                        }
                    }
                }
            }
        }
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut st = self.state.lock();
        if st.lock == UNLOCKED {
            st.lock = LOCKED;
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn unlock(&self) {
        let mut st = self.state.lock();
        match st.wq.pop_front() {
            None => st.lock = UNLOCKED,
            Some(Some(co)) => {
                drop(st);
                scheduler::resume(co);
            }
            Some(None) => {
                st.lock = LOCKED_FOR_THREAD;
                drop(st);
                self.cv.notify_one();
            }
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{go, scheds};
    use crate::sync::WaitGroup;
    use std::sync::Arc;

    #[test]
    fn uncontended_lock_and_try_lock() {
        let m = Mutex::new(5);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.try_lock().is_none());
        }
        assert_eq!(*m.try_lock().unwrap(), 6);
    }

    #[test]
    fn thread_contention() {
        let m = Arc::new(Mutex::new(0u64));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let m = m.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *m.lock() += 1;
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*m.lock(), 4000);
    }

    #[test]
    fn coroutine_contention_loses_no_updates() {
        // 64 coroutines spread over every scheduler, 1000 increments each.
        let m = Arc::new(Mutex::new(0u64));
        let wg = WaitGroup::new(64);
        for i in 0..64usize {
            let m = m.clone();
            let wg = wg.clone();
            let sched = &scheds()[i % scheds().len()];
            sched.go(move || {
                for _ in 0..1000 {
                    *m.lock() += 1;
                }
                wg.done();
            });
        }
        wg.wait();
        assert_eq!(*m.lock(), 64000);
    }

    #[test]
    fn mixed_thread_and_coroutine_contention() {
        let m = Arc::new(Mutex::new(0u64));
        let wg = WaitGroup::new(8);
        for _ in 0..8 {
            let m = m.clone();
            let wg = wg.clone();
            go(move || {
                for _ in 0..100 {
                    *m.lock() += 1;
                }
                wg.done();
            });
        }
        let mut threads = Vec::new();
        for _ in 0..4 {
            let m = m.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    *m.lock() += 1;
                }
            }));
        }
        wg.wait();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*m.lock(), 1200);
    }
}
