//! Bounded channel with blocking send/receive and close semantics.
//!
//! A ring of element slots guarded by one mutex, plus an intrusive queue of
//! pending operations. When the buffer is empty a sender hands its element
//! straight into the oldest reader's waiter record; when it is full a sender
//! parks carrying the element in its own record. Waiters may be coroutines
//! or plain threads. A per-channel timeout (fixed at construction) bounds
//! every blocking operation; the race between a timeout and a matching
//! operation is settled by the waiter-state CAS, so each element is consumed
//! exactly once.

use std::cell::Cell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::coroutine::{CoroutineHandle, Waitx};
use crate::scheduler::{self, Scheduler};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

const PENDING: u8 = 0;
const DONE_OK: u8 = 1;
const DONE_CLOSED: u8 = 2;

thread_local! {
    static LAST_DONE: Cell<bool> = const { Cell::new(false) };
}

fn set_done(v: bool) -> bool {
    LAST_DONE.with(|c| c.set(v));
    v
}

/// One parked channel operation. For a parked sender `val` carries the
/// element in; for a parked reader the matching sender (or `close`) fills
/// `val`/`done` before waking it.
struct ChanWaiter<T> {
    wx: Arc<Waitx>,
    /// `None` marks a thread waiter, woken via the channel condvar.
    co: Option<CoroutineHandle>,
    cell: Mutex<WaiterCell<T>>,
}

struct WaiterCell<T> {
    val: Option<T>,
    done: u8,
}

impl<T> ChanWaiter<T> {
    fn new(co: Option<CoroutineHandle>, val: Option<T>) -> Arc<Self> {
        Arc::new(ChanWaiter {
            wx: Waitx::new(),
            co,
            cell: Mutex::new(WaiterCell { val, done: PENDING }),
        })
    }
}

struct Ring<T> {
    buf: Box<[MaybeUninit<T>]>,
    rx: usize,
    wx: usize,
    full: bool,
    wq: VecDeque<Arc<ChanWaiter<T>>>,
}

impl<T> Ring<T> {
    fn is_empty(&self) -> bool {
        self.rx == self.wx && !self.full
    }

    fn is_full(&self) -> bool {
        self.rx == self.wx && self.full
    }

    fn push(&mut self, v: T) {
        debug_assert!(!self.is_full());
        self.buf[self.wx] = MaybeUninit::new(v);
        self.wx = (self.wx + 1) % self.buf.len();
        if self.wx == self.rx {
            self.full = true;
        }
    }

    /// Takes the oldest element. The caller decides when `full` clears (a
    /// parked sender may refill the slot immediately).
    fn pop(&mut self) -> T {
        debug_assert!(!self.is_empty());
        let v = unsafe { self.buf[self.rx].assume_init_read() };
        self.rx = (self.rx + 1) % self.buf.len();
        v
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        let mut n = if self.full {
            self.buf.len()
        } else {
            (self.wx + self.buf.len() - self.rx) % self.buf.len()
        };
        while n > 0 {
            unsafe { self.buf[self.rx].assume_init_drop() };
            self.rx = (self.rx + 1) % self.buf.len();
            n -= 1;
        }
    }
}

struct ChanInner<T> {
    ring: Mutex<Ring<T>>,
    cv: Condvar,
    /// Deadline applied to every blocking operation; `None` blocks forever.
    ms: Option<Duration>,
    closed: AtomicU8,
}

/// A bounded multi-producer multi-consumer channel. Clones share the same
/// channel; endpoints may be coroutines or plain threads in any combination.
pub struct Chan<T> {
    inner: Arc<ChanInner<T>>,
}

impl<T> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Chan {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Chan<T> {
    /// A channel buffering up to `cap` elements (at least one slot is always
    /// allocated) whose operations block indefinitely.
    pub fn new(cap: usize) -> Self {
        Self::build(cap, None)
    }

    /// A channel whose blocking operations give up after `timeout`;
    /// afterwards [`crate::timeout()`] distinguishes timeout from closure.
    pub fn with_timeout(cap: usize, timeout: Duration) -> Self {
        Self::build(cap, Some(timeout))
    }

    fn build(cap: usize, ms: Option<Duration>) -> Self {
        let cap = cap.max(1);
        let buf = (0..cap)
            .map(|_| MaybeUninit::uninit())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Chan {
            inner: Arc::new(ChanInner {
                ring: Mutex::new(Ring {
                    buf,
                    rx: 0,
                    wx: 0,
                    full: false,
                    wq: VecDeque::new(),
                }),
                cv: Condvar::new(),
                ms,
                closed: AtomicU8::new(OPEN),
            }),
        }
    }

    /// Whether the last `send`/`recv` on this thread completed with data
    /// movement (parity accessor; both operations also report this as their
    /// return value).
    pub fn done(&self) -> bool {
        LAST_DONE.with(|c| c.get())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed) != OPEN
    }

    /// Sends an element. Returns false (dropping the element) if the channel
    /// is closed or the channel timeout expires first.
    pub fn send(&self, v: T) -> bool {
        let mut ring = self.inner.ring.lock();
        if self.is_closed() {
            drop(ring);
            return set_done(false);
        }

        // Partial buffer: append.
        if !ring.is_empty() && !ring.is_full() {
            ring.push(v);
            drop(ring);
            return set_done(true);
        }

        if ring.is_empty() {
            // Hand the element straight to the oldest live reader.
            while let Some(w) = ring.wq.pop_front() {
                if self.inner.ms.is_none() || w.wx.try_ready() {
                    {
                        let mut cell = w.cell.lock();
                        cell.val = Some(v);
                        cell.done = DONE_OK;
                    }
                    match w.co {
                        Some(co) => {
                            drop(ring);
                            scheduler::resume(co);
                        }
                        None => {
                            self.inner.cv.notify_all();
                            drop(ring);
                        }
                    }
                    return set_done(true);
                }
                // Timed-out reader; discard the record.
            }
            ring.push(v);
            drop(ring);
            return set_done(true);
        }

        // Full buffer: park, carrying the element.
        match scheduler::sched().filter(|s| s.running()) {
            Some(s) => self.send_park_co(ring, s, v),
            None => self.send_park_thread(ring, v),
        }
    }

    fn send_park_co(
        &self,
        mut ring: parking_lot::MutexGuard<'_, Ring<T>>,
        s: &'static Scheduler,
        v: T,
    ) -> bool {
        let w = ChanWaiter::new(Some(s.current_handle().unwrap()), Some(v));
        ring.wq.push_back(w.clone());
        drop(ring);

        s.set_waitx(Some(w.wx.clone()));
        if let Some(d) = self.inner.ms {
            s.add_timer_current(d);
        }
        s.yield_current();
        s.set_waitx(None);

        if s.timeout_flag() {
            // The element still sits in the abandoned record and is dropped
            // with it.
            return set_done(false);
        }
        debug_assert_eq!(w.cell.lock().done, DONE_OK);
        set_done(true)
    }

    fn send_park_thread(&self, mut ring: parking_lot::MutexGuard<'_, Ring<T>>, v: T) -> bool {
        let w = ChanWaiter::new(None, Some(v));
        ring.wq.push_back(w.clone());
        loop {
            let timed_out = match self.inner.ms {
                None => {
                    self.inner.cv.wait(&mut ring);
                    false
                }
                Some(d) => self.inner.cv.wait_for(&mut ring, d).timed_out(),
            };
            if !timed_out || !w.wx.try_timeout() {
                let done = w.cell.lock().done;
                if done != PENDING {
                    debug_assert_eq!(done, DONE_OK);
                    drop(ring);
                    return set_done(true);
                }
                // Spurious or raced wakeup; keep waiting.
            } else {
                drop(ring);
                return set_done(false);
            }
        }
    }

    /// Receives an element. Returns `None` if the channel is closed and
    /// drained, or the channel timeout expires first ([`crate::timeout()`]
    /// tells the cases apart inside a coroutine).
    pub fn recv(&self) -> Option<T> {
        let mut ring = self.inner.ring.lock();

        // Partial buffer: plain take.
        if !ring.is_empty() && !ring.is_full() {
            let v = ring.pop();
            drop(ring);
            set_done(true);
            return Some(v);
        }

        if ring.is_full() {
            let v = ring.pop();
            // The freed slot goes to the oldest parked sender, keeping the
            // buffer full and the arrival order intact.
            while let Some(w) = ring.wq.pop_front() {
                if self.inner.ms.is_none() || w.wx.try_ready() {
                    let elem = {
                        let mut cell = w.cell.lock();
                        cell.done = DONE_OK;
                        cell.val.take().unwrap()
                    };
                    ring.push(elem);
                    match w.co {
                        Some(co) => {
                            drop(ring);
                            scheduler::resume(co);
                        }
                        None => {
                            self.inner.cv.notify_all();
                            drop(ring);
                        }
                    }
                    set_done(true);
                    return Some(v);
                }
                // Timed-out sender; its element is dropped with the record.
            }
            ring.full = false;
            drop(ring);
            set_done(true);
            return Some(v);
        }

        // Empty buffer.
        if self.is_closed() {
            drop(ring);
            set_done(false);
            return None;
        }
        match scheduler::sched().filter(|s| s.running()) {
            Some(s) => self.recv_park_co(ring, s),
            None => self.recv_park_thread(ring),
        }
    }

    fn recv_park_co(
        &self,
        mut ring: parking_lot::MutexGuard<'_, Ring<T>>,
        s: &'static Scheduler,
    ) -> Option<T> {
        let w = ChanWaiter::new(Some(s.current_handle().unwrap()), None);
        ring.wq.push_back(w.clone());
        drop(ring);

        s.set_waitx(Some(w.wx.clone()));
        if let Some(d) = self.inner.ms {
            s.add_timer_current(d);
        }
        s.yield_current();
        s.set_waitx(None);

        if s.timeout_flag() {
            set_done(false);
            return None;
        }
        let mut cell = w.cell.lock();
        if cell.done == DONE_OK {
            set_done(true);
            cell.val.take()
        } else {
            debug_assert_eq!(cell.done, DONE_CLOSED);
            set_done(false);
            None
        }
    }

    fn recv_park_thread(&self, mut ring: parking_lot::MutexGuard<'_, Ring<T>>) -> Option<T> {
        let w = ChanWaiter::new(None, None);
        ring.wq.push_back(w.clone());
        loop {
            let timed_out = match self.inner.ms {
                None => {
                    self.inner.cv.wait(&mut ring);
                    false
                }
                Some(d) => self.inner.cv.wait_for(&mut ring, d).timed_out(),
            };
            if !timed_out || !w.wx.try_timeout() {
                let mut cell = w.cell.lock();
                match cell.done {
                    DONE_OK => {
                        let v = cell.val.take();
                        drop(cell);
                        drop(ring);
                        set_done(true);
                        return v;
                    }
                    DONE_CLOSED => {
                        drop(cell);
                        drop(ring);
                        set_done(false);
                        return None;
                    }
                    _ => {} // spurious or raced wakeup
                }
            } else {
                drop(ring);
                set_done(false);
                return None;
            }
        }
    }

    /// Closes the channel. Pending readers on an empty channel observe the
    /// closed state immediately; buffered elements remain receivable. A
    /// concurrent second closer spins until the close has completed.
    pub fn close(&self) {
        match self
            .inner
            .closed
            .compare_exchange(OPEN, CLOSING, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => {
                let mut ring = self.inner.ring.lock();
                if ring.is_empty() {
                    while let Some(w) = ring.wq.pop_front() {
                        if w.wx.try_ready() {
                            w.cell.lock().done = DONE_CLOSED;
                            match w.co {
                                Some(co) => scheduler::resume(co),
                                None => {
                                    self.inner.cv.notify_all();
                                }
                            }
                        }
                        // Timed-out waiters are simply discarded.
                    }
                }
                self.inner.closed.store(CLOSED, Ordering::Relaxed);
            }
            Err(CLOSING) => {
                // Another closer is mid-flight; wait it out.
                while self.inner.closed.load(Ordering::Relaxed) != CLOSED {
                    crate::sleep(Duration::from_millis(1));
                }
            }
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::go;
    use std::sync::mpsc;

    #[test]
    fn buffered_order_with_blocking_writer() {
        // Capacity 1: the writer must park between sends, and the reader
        // still observes submission order.
        let ch = Chan::new(1);
        let (tx, rx) = mpsc::channel();

        let ch_w = ch.clone();
        go(move || {
            for v in [10, 11, 12] {
                assert!(ch_w.send(v));
            }
        });
        let ch_r = ch.clone();
        go(move || {
            for _ in 0..3 {
                tx.send(ch_r.recv().unwrap()).unwrap();
            }
        });

        let got: Vec<i32> = (0..3).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, vec![10, 11, 12]);
    }

    #[test]
    fn recv_timeout_reports_timeout() {
        let ch = Chan::<i32>::with_timeout(1, Duration::from_millis(10));
        let (tx, rx) = mpsc::channel();
        go(move || {
            let t0 = crate::time::now_ms();
            let v = ch.recv();
            let waited = crate::time::now_ms() - t0;
            tx.send((v, ch.done(), crate::timeout(), waited)).unwrap();
        });
        let (v, done, timed_out, waited) = rx.recv().unwrap();
        assert_eq!(v, None);
        assert!(!done);
        assert!(timed_out);
        assert!(waited >= 10);
    }

    #[test]
    fn close_drains_then_fails() {
        let ch = Chan::new(4);
        let ch_w = ch.clone();
        go(move || {
            for v in [1, 2, 3] {
                assert!(ch_w.send(v));
            }
            ch_w.close();
        });

        let (tx, rx) = mpsc::channel();
        let ch_r = ch.clone();
        go(move || {
            let mut got = Vec::new();
            for _ in 0..3 {
                got.push(ch_r.recv());
            }
            let after_close = ch_r.recv();
            tx.send((got, after_close, ch_r.done())).unwrap();
        });

        let (got, after_close, done) = rx.recv().unwrap();
        assert_eq!(got, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(after_close, None);
        assert!(!done);
        assert!(ch.is_closed());
    }

    #[test]
    fn send_on_closed_fails() {
        let ch = Chan::new(1);
        ch.close();
        assert!(!ch.send(1));
        assert!(!ch.done());
    }

    #[test]
    fn close_wakes_pending_reader() {
        let ch = Chan::<i32>::new(1);
        let (tx, rx) = mpsc::channel();
        let ch_r = ch.clone();
        go(move || {
            tx.send(ch_r.recv()).unwrap();
        });
        std::thread::sleep(Duration::from_millis(10));
        ch.close();
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn thread_endpoints_interoperate_with_coroutines() {
        let ch = Chan::new(1);

        // Thread sender, coroutine reader.
        let ch_r = ch.clone();
        let (tx, rx) = mpsc::channel();
        go(move || {
            let mut got = Vec::new();
            for _ in 0..5 {
                got.push(ch_r.recv().unwrap());
            }
            tx.send(got).unwrap();
        });
        for v in 0..5 {
            assert!(ch.send(v));
        }
        assert_eq!(rx.recv().unwrap(), vec![0, 1, 2, 3, 4]);

        // Coroutine sender, thread reader.
        let ch_w = ch.clone();
        go(move || {
            for v in 5..8 {
                assert!(ch_w.send(v));
            }
        });
        let got: Vec<i32> = (0..3).map(|_| ch.recv().unwrap()).collect();
        assert_eq!(got, vec![5, 6, 7]);
    }

    #[test]
    fn direct_handoff_skips_the_buffer() {
        // A parked reader receives straight from the sender even though the
        // buffer has room.
        let ch = Chan::new(8);
        let ch_r = ch.clone();
        let (tx, rx) = mpsc::channel();
        go(move || {
            tx.send(ch_r.recv().unwrap()).unwrap();
        });
        std::thread::sleep(Duration::from_millis(10));
        assert!(ch.send(42));
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn concurrent_close_is_idempotent() {
        let ch = Chan::<i32>::new(1);
        let mut threads = Vec::new();
        for _ in 0..4 {
            let ch = ch.clone();
            threads.push(std::thread::spawn(move || ch.close()));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert!(ch.is_closed());
    }

    #[test]
    fn unread_elements_are_dropped_with_the_channel() {
        let ch = Chan::new(4);
        let arc = Arc::new(0u8);
        assert!(ch.send(arc.clone()));
        assert!(ch.send(arc.clone()));
        assert_eq!(Arc::strong_count(&arc), 3);
        drop(ch);
        assert_eq!(Arc::strong_count(&arc), 1);
    }
}
