//! Events and wait groups.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::coroutine::{CoroutineHandle, Waitx, ST_TIMEOUT};
use crate::scheduler::{self, Scheduler};

struct EvWaiter {
    wx: Arc<Waitx>,
    co: CoroutineHandle,
}

struct EventState {
    /// Suspended coroutine waiters, in arrival order.
    waiters: VecDeque<EvWaiter>,
    /// Number of blocked thread waiters.
    wt: u32,
    /// Signal serial; lets a timed-out thread waiter detect that a signal
    /// already consumed its slot in `wt`.
    sn: u32,
    signaled: bool,
}

struct EventInner {
    state: Mutex<EventState>,
    cv: Condvar,
    manual_reset: bool,
    /// Counter when this event body backs a [`WaitGroup`].
    wg: AtomicU32,
}

/// A signalable event usable from coroutines and plain threads alike.
///
/// Auto-reset by default: a signal that finds waiters wakes all of them and
/// stays clear; a signal with nobody waiting is latched for the next waiter.
/// Clones share the same event.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new(manual_reset: bool, signaled: bool) -> Self {
        Event {
            inner: Arc::new(EventInner {
                state: Mutex::new(EventState {
                    waiters: VecDeque::new(),
                    wt: 0,
                    sn: 0,
                    signaled,
                }),
                cv: Condvar::new(),
                manual_reset,
                wg: AtomicU32::new(0),
            }),
        }
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        self.wait_opt(None);
    }

    /// Blocks for up to `timeout`; returns false on timeout. A zero timeout
    /// probes the signaled state without blocking.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_opt(Some(timeout))
    }

    fn wait_opt(&self, timeout: Option<Duration>) -> bool {
        match scheduler::sched() {
            Some(s) if s.running() => self.wait_co(s, timeout),
            _ => self.wait_thread(timeout),
        }
    }

    fn wait_co(&self, s: &'static Scheduler, timeout: Option<Duration>) -> bool {
        {
            let mut st = self.inner.state.lock();
            if st.signaled {
                if !self.inner.manual_reset {
                    st.signaled = false;
                }
                return true;
            }
            if timeout.is_some_and(|d| d.is_zero()) {
                return false;
            }

            // Reap waiters whose timeout already fired; nobody else will.
            while let Some(w) = st.waiters.front() {
                if w.wx.state() != ST_TIMEOUT {
                    break;
                }
                st.waiters.pop_front();
            }

            let wx = Waitx::new();
            s.set_waitx(Some(wx.clone()));
            let co = s.current_handle().unwrap();
            st.waiters.push_back(EvWaiter { wx, co });
        }

        if let Some(d) = timeout {
            s.add_timer_current(d);
        }
        s.yield_current();
        s.set_waitx(None);
        !s.timeout_flag()
    }

    fn wait_thread(&self, timeout: Option<Duration>) -> bool {
        let mut st = self.inner.state.lock();
        if st.signaled {
            if !self.inner.manual_reset {
                st.signaled = false;
            }
            return true;
        }
        match timeout {
            Some(d) if d.is_zero() => false,
            Some(d) => {
                let sn = st.sn;
                st.wt += 1;
                let r = !self.inner.cv.wait_for(&mut st, d).timed_out();
                if !r && sn == st.sn {
                    debug_assert!(st.wt > 0);
                    st.wt -= 1;
                }
                r
            }
            None => {
                st.wt += 1;
                self.inner.cv.wait(&mut st);
                true
            }
        }
    }

    /// Wakes every waiter. If nobody is waiting the signal is latched.
    pub fn signal(&self) {
        let mut pending;
        {
            let mut st = self.inner.state.lock();
            let has_wt = st.wt > 0;
            if has_wt {
                st.wt = 0;
            }

            let mut has_wc = false;
            pending = std::mem::take(&mut st.waiters);
            if !has_wt {
                // Find one live coroutine waiter before deciding whether the
                // signal is consumed or latched; the rest wake after unlock.
                while let Some(w) = pending.pop_front() {
                    if w.wx.try_ready() {
                        has_wc = true;
                        scheduler::resume(w.co);
                        break;
                    }
                    // Timed out; dropping the record frees it.
                }
            }

            if has_wt || has_wc {
                if st.signaled && !self.inner.manual_reset {
                    st.signaled = false;
                }
                if has_wt {
                    st.sn += 1;
                    self.inner.cv.notify_all();
                }
            } else if pending.is_empty() {
                if !st.signaled {
                    st.signaled = true;
                }
            }
        }

        for w in pending {
            if w.wx.try_ready() {
                scheduler::resume(w.co);
            }
        }
    }

    /// Clears a latched signal (meaningful for manual-reset events).
    pub fn reset(&self) {
        self.inner.state.lock().signaled = false;
    }
}

/// A wait group: blocks waiters until its counter returns to zero.
/// Clones share the same counter.
#[derive(Clone)]
pub struct WaitGroup {
    ev: Event,
}

impl WaitGroup {
    /// Creates a wait group with the counter initialized to `n`.
    pub fn new(n: u32) -> Self {
        let ev = Event::new(false, false);
        ev.inner.wg.store(n, Ordering::Relaxed);
        WaitGroup { ev }
    }

    /// Increments the counter by `n`.
    pub fn add(&self, n: u32) {
        self.ev.inner.wg.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrements the counter; the decrement that reaches zero releases all
    /// waiters. Decrementing past zero panics.
    pub fn done(&self) {
        let prev = self.ev.inner.wg.fetch_sub(1, Ordering::AcqRel);
        assert!(prev != 0, "wait_group counter underflow");
        if prev == 1 {
            self.ev.signal();
        }
    }

    /// Blocks until the counter reaches zero.
    pub fn wait(&self) {
        self.ev.wait();
    }

    /// Current counter value.
    pub fn load(&self) -> u32 {
        self.ev.inner.wg.load(Ordering::Acquire)
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        WaitGroup::new(0)
    }
}

/// Thread-only event with the same reset semantics as [`Event`], for code
/// that never runs in a coroutine (the scheduler's own shutdown handshake
/// uses one).
pub struct SyncEvent {
    state: Mutex<SyncState>,
    cv: Condvar,
    manual_reset: bool,
}

struct SyncState {
    wt: u32,
    sn: u32,
    signaled: bool,
}

impl SyncEvent {
    pub fn new(manual_reset: bool, signaled: bool) -> Self {
        SyncEvent {
            state: Mutex::new(SyncState {
                wt: 0,
                sn: 0,
                signaled,
            }),
            cv: Condvar::new(),
            manual_reset,
        }
    }

    pub fn wait(&self) {
        let mut st = self.state.lock();
        if st.signaled {
            if !self.manual_reset {
                st.signaled = false;
            }
            return;
        }
        st.wt += 1;
        self.cv.wait(&mut st);
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut st = self.state.lock();
        if st.signaled {
            if !self.manual_reset {
                st.signaled = false;
            }
            return true;
        }
        if timeout.is_zero() {
            return false;
        }
        let sn = st.sn;
        st.wt += 1;
        let r = !self.cv.wait_for(&mut st, timeout).timed_out();
        if !r && sn == st.sn {
            debug_assert!(st.wt > 0);
            st.wt -= 1;
        }
        r
    }

    pub fn signal(&self) {
        let mut st = self.state.lock();
        if st.wt > 0 {
            st.wt = 0;
            if st.signaled && !self.manual_reset {
                st.signaled = false;
            }
            st.sn += 1;
            self.cv.notify_all();
        } else if !st.signaled {
            st.signaled = true;
        }
    }

    pub fn reset(&self) {
        self.state.lock().signaled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::go;
    use std::sync::mpsc;

    #[test]
    fn latched_signal_is_consumed_once() {
        let ev = Event::new(false, false);
        ev.signal();
        assert!(ev.wait_for(Duration::ZERO)); // latched, consumed
        assert!(!ev.wait_for(Duration::ZERO)); // auto-reset cleared it
    }

    #[test]
    fn manual_reset_stays_signaled() {
        let ev = Event::new(true, false);
        ev.signal();
        assert!(ev.wait_for(Duration::ZERO));
        assert!(ev.wait_for(Duration::ZERO));
        ev.reset();
        assert!(!ev.wait_for(Duration::ZERO));
    }

    #[test]
    fn thread_waiter_times_out() {
        let ev = Event::new(false, false);
        let t0 = std::time::Instant::now();
        assert!(!ev.wait_for(Duration::from_millis(20)));
        assert!(t0.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn signal_crosses_from_thread_to_coroutine() {
        let ev = Event::new(false, false);
        let (tx, rx) = mpsc::channel();
        let ev2 = ev.clone();
        go(move || {
            tx.send(ev2.wait_for(Duration::from_secs(10))).unwrap();
        });
        std::thread::sleep(Duration::from_millis(10));
        ev.signal();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn coroutine_wait_times_out() {
        let ev = Event::new(false, false);
        let (tx, rx) = mpsc::channel();
        go(move || {
            let ok = ev.wait_for(Duration::from_millis(10));
            tx.send((ok, crate::timeout())).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), (false, true));
    }

    #[test]
    fn wait_group_fan_out() {
        let wg = WaitGroup::new(8);
        for i in 0..8u64 {
            let wg = wg.clone();
            go(move || {
                crate::sleep(Duration::from_millis(i % 5));
                wg.done();
            });
        }
        wg.wait();
        assert_eq!(wg.load(), 0);
    }

    #[test]
    fn wait_group_from_coroutine() {
        let wg = WaitGroup::new(2);
        let (tx, rx) = mpsc::channel();
        {
            let wg = wg.clone();
            go(move || {
                wg.wait();
                tx.send(wg.load()).unwrap();
            });
        }
        for _ in 0..2 {
            let wg = wg.clone();
            go(move || wg.done());
        }
        assert_eq!(rx.recv().unwrap(), 0);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn wait_group_underflow_panics() {
        let wg = WaitGroup::new(0);
        wg.done();
    }

    #[test]
    fn sync_event_latches_across_threads() {
        let ev = std::sync::Arc::new(SyncEvent::new(false, false));
        let ev2 = ev.clone();
        let t = std::thread::spawn(move || ev2.wait());
        std::thread::sleep(Duration::from_millis(5));
        ev.signal();
        t.join().unwrap();

        // Signal with no waiter latches for the next wait.
        ev.signal();
        assert!(ev.wait_for(Duration::ZERO));
    }
}
