//! Readiness poller with a thread-safe wakeup.
//!
//! One poller per scheduler. The owning thread registers coroutines waiting
//! for read or write readiness on a descriptor and blocks in [`Poller::wait`]
//! for up to the next timer deadline; any thread may interrupt the wait
//! through the [`Wakeup`] handle (an eventfd on Linux, a self-pipe on kqueue
//! platforms), which is itself part of the poll set.
//!
//! At most one waiter may be registered per fd and direction; a second
//! registration in an occupied direction is a checked panic. Waiters are
//! consumed when their readiness is delivered; the fd itself stays in the
//! poll set until `del_event`/`del_events`.

use std::collections::HashMap;
use std::io;

use crate::error::{Error, Result};

/// Direction of an I/O interest.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dir {
    Read,
    Write,
}

#[derive(Default)]
struct FdState {
    rco: Option<u32>,
    wco: Option<u32>,
    #[cfg(target_os = "linux")]
    mask: u32,
}

const WAIT_EVENTS: usize = 1024;

/// Thread-safe poller wakeup. Writes are coalesced by the kernel object, so
/// signaling an already-signaled poller is cheap.
#[derive(Clone)]
pub(crate) struct Wakeup {
    wfd: i32,
}

impl Wakeup {
    pub fn signal(&self) {
        // EAGAIN means a wakeup is already pending.
        #[cfg(target_os = "linux")]
        {
            let one: u64 = 1;
            unsafe { libc::write(self.wfd, &one as *const u64 as *const libc::c_void, 8) };
        }
        #[cfg(not(target_os = "linux"))]
        {
            let one: u8 = 1;
            unsafe { libc::write(self.wfd, &one as *const u8 as *const libc::c_void, 1) };
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_nonblocking_cloexec(fd: i32) -> io::Result<()> {
    unsafe {
        if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) == -1
            || libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) == -1
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ===== epoll backend =====

#[cfg(target_os = "linux")]
pub(crate) struct Poller {
    epfd: i32,
    wakeup_fd: i32,
    registry: HashMap<i32, FdState>,
    events: Vec<libc::epoll_event>,
}

#[cfg(target_os = "linux")]
impl Poller {
    pub fn new() -> Result<(Poller, Wakeup)> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(Error::PollerCreate(io::Error::last_os_error()));
        }
        let efd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if efd == -1 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(Error::PollerCreate(e));
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: efd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, efd, &mut ev) } == -1 {
            let e = io::Error::last_os_error();
            unsafe {
                libc::close(efd);
                libc::close(epfd);
            }
            return Err(Error::PollerCreate(e));
        }

        Ok((
            Poller {
                epfd,
                wakeup_fd: efd,
                registry: HashMap::new(),
                events: Vec::with_capacity(WAIT_EVENTS),
            },
            Wakeup { wfd: efd },
        ))
    }

    pub fn add_event(&mut self, fd: i32, dir: Dir, co_id: u32) -> Result<()> {
        let state = self.registry.entry(fd).or_default();
        let occupied = match dir {
            Dir::Read => state.rco,
            Dir::Write => state.wco,
        };
        assert!(
            occupied.is_none(),
            "fd {} already has a {:?} waiter (coroutine {})",
            fd,
            dir,
            occupied.unwrap_or(0)
        );

        let bit = match dir {
            Dir::Read => libc::EPOLLIN as u32,
            Dir::Write => libc::EPOLLOUT as u32,
        };
        let old_mask = state.mask;
        let want = old_mask | bit;
        if want != old_mask {
            let op = if old_mask == 0 {
                libc::EPOLL_CTL_ADD
            } else {
                libc::EPOLL_CTL_MOD
            };
            let mut ev = libc::epoll_event {
                events: want,
                u64: fd as u64,
            };
            if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } == -1 {
                let e = io::Error::last_os_error();
                if old_mask == 0 {
                    self.registry.remove(&fd);
                }
                return Err(Error::PollerRegister { fd, source: e });
            }
        }

        let state = self.registry.get_mut(&fd).unwrap();
        state.mask = want;
        match dir {
            Dir::Read => state.rco = Some(co_id),
            Dir::Write => state.wco = Some(co_id),
        }
        Ok(())
    }

    pub fn del_event(&mut self, fd: i32, dir: Dir) {
        let Some(state) = self.registry.get_mut(&fd) else {
            return;
        };
        let bit = match dir {
            Dir::Read => {
                state.rco = None;
                libc::EPOLLIN as u32
            }
            Dir::Write => {
                state.wco = None;
                libc::EPOLLOUT as u32
            }
        };
        let want = state.mask & !bit;
        if want == state.mask {
            return;
        }
        if want == 0 {
            self.del_events(fd);
            return;
        }
        state.mask = want;
        let mut ev = libc::epoll_event {
            events: want,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) } == -1 {
            log::error!(
                "EPOLL_CTL_MOD failed for fd {}: {}",
                fd,
                io::Error::last_os_error()
            );
        }
    }

    pub fn del_events(&mut self, fd: i32) {
        if self.registry.remove(&fd).is_none() {
            return;
        }
        let mut unused = libc::epoll_event { events: 0, u64: 0 };
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut unused) } == -1 {
            log::error!(
                "EPOLL_CTL_DEL failed for fd {}: {}",
                fd,
                io::Error::last_os_error()
            );
        }
    }

    /// Blocks for readiness or wakeup, resolving ready events to the waiting
    /// coroutine ids (read waiter before write waiter per fd). An error
    /// condition with neither IN nor OUT set wakes both directions.
    pub fn wait(&mut self, timeout_ms: Option<u64>, ready: &mut Vec<u32>) -> Result<()> {
        let timeout = match timeout_ms {
            Some(ms) => ms.min(i32::MAX as u64) as i32,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                WAIT_EVENTS as i32,
                timeout,
            )
        };
        if n == -1 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Error::PollerWait(e));
        }
        unsafe { self.events.set_len(n as usize) };

        for i in 0..n as usize {
            let ev = self.events[i];
            let fd = ev.u64 as i32;
            if fd == self.wakeup_fd {
                let mut counter = 0u64;
                unsafe { libc::read(self.wakeup_fd, &mut counter as *mut u64 as *mut _, 8) };
                continue;
            }
            let Some(state) = self.registry.get_mut(&fd) else {
                continue; // stale readiness after del_events
            };
            let readable = ev.events & libc::EPOLLIN as u32 != 0;
            let writable = ev.events & libc::EPOLLOUT as u32 != 0;
            if readable || !writable {
                if let Some(co) = state.rco.take() {
                    ready.push(co);
                }
            }
            if writable || !readable {
                if let Some(co) = state.wco.take() {
                    ready.push(co);
                }
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
            libc::close(self.epfd);
        }
    }
}

// ===== kqueue backend =====

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) struct Poller {
    kq: i32,
    pipe_r: i32,
    pipe_w: i32,
    registry: HashMap<i32, FdState>,
    events: Vec<libc::kevent>,
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
impl Poller {
    pub fn new() -> Result<(Poller, Wakeup)> {
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(Error::PollerCreate(io::Error::last_os_error()));
        }

        let cleanup = |e: io::Error, fds: &[i32]| {
            for &fd in fds {
                unsafe { libc::close(fd) };
            }
            Err(Error::PollerCreate(e))
        };

        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return cleanup(io::Error::last_os_error(), &[kq]);
        }
        for fd in fds {
            if let Err(e) = set_nonblocking_cloexec(fd) {
                return cleanup(e, &[kq, fds[0], fds[1]]);
            }
        }

        let mut poller = Poller {
            kq,
            pipe_r: fds[0],
            pipe_w: fds[1],
            registry: HashMap::new(),
            events: Vec::with_capacity(WAIT_EVENTS),
        };
        if poller
            .kevent_ctl(fds[0], libc::EVFILT_READ, libc::EV_ADD)
            .is_err()
        {
            // Poller's Drop closes the fds.
            return Err(Error::PollerCreate(io::Error::last_os_error()));
        }
        let wakeup = Wakeup { wfd: fds[1] };
        Ok((poller, wakeup))
    }

    fn kevent_ctl(&mut self, fd: i32, filter: i16, flags: u16) -> Result<()> {
        // Field-by-field over zeroed storage; the struct layout grows a
        // trailing member on some BSDs.
        let mut change: libc::kevent = unsafe { std::mem::zeroed() };
        change.ident = fd as usize;
        change.filter = filter;
        change.flags = flags;
        let r = unsafe {
            libc::kevent(
                self.kq,
                &change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if r == -1 {
            return Err(Error::PollerRegister {
                fd,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub fn add_event(&mut self, fd: i32, dir: Dir, co_id: u32) -> Result<()> {
        let state = self.registry.entry(fd).or_default();
        let occupied = match dir {
            Dir::Read => state.rco,
            Dir::Write => state.wco,
        };
        assert!(
            occupied.is_none(),
            "fd {} already has a {:?} waiter (coroutine {})",
            fd,
            dir,
            occupied.unwrap_or(0)
        );

        let filter = match dir {
            Dir::Read => libc::EVFILT_READ,
            Dir::Write => libc::EVFILT_WRITE,
        };
        if let Err(e) = self.kevent_ctl(fd, filter, libc::EV_ADD) {
            let state = self.registry.get_mut(&fd).unwrap();
            let empty = state.rco.is_none() && state.wco.is_none();
            if empty {
                self.registry.remove(&fd);
            }
            return Err(e);
        }

        let state = self.registry.get_mut(&fd).unwrap();
        match dir {
            Dir::Read => state.rco = Some(co_id),
            Dir::Write => state.wco = Some(co_id),
        }
        Ok(())
    }

    pub fn del_event(&mut self, fd: i32, dir: Dir) {
        let Some(state) = self.registry.get_mut(&fd) else {
            return;
        };
        let filter = match dir {
            Dir::Read => {
                state.rco = None;
                libc::EVFILT_READ
            }
            Dir::Write => {
                state.wco = None;
                libc::EVFILT_WRITE
            }
        };
        let empty = state.rco.is_none() && state.wco.is_none();
        if empty {
            self.registry.remove(&fd);
        }
        if let Err(e) = self.kevent_ctl(fd, filter, libc::EV_DELETE) {
            log::error!("kevent EV_DELETE failed: {}", e);
        }
    }

    pub fn del_events(&mut self, fd: i32) {
        let Some(state) = self.registry.remove(&fd) else {
            return;
        };
        if state.rco.is_some() {
            if let Err(e) = self.kevent_ctl(fd, libc::EVFILT_READ, libc::EV_DELETE) {
                log::error!("kevent EV_DELETE failed: {}", e);
            }
        }
        if state.wco.is_some() {
            if let Err(e) = self.kevent_ctl(fd, libc::EVFILT_WRITE, libc::EV_DELETE) {
                log::error!("kevent EV_DELETE failed: {}", e);
            }
        }
    }

    /// Blocks for readiness or wakeup, resolving ready events to the waiting
    /// coroutine ids.
    pub fn wait(&mut self, timeout_ms: Option<u64>, ready: &mut Vec<u32>) -> Result<()> {
        let ts;
        let timeout = match timeout_ms {
            Some(ms) => {
                ts = libc::timespec {
                    tv_sec: (ms / 1000) as libc::time_t,
                    tv_nsec: ((ms % 1000) * 1_000_000) as _,
                };
                &ts as *const libc::timespec
            }
            None => std::ptr::null(),
        };
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                WAIT_EVENTS as i32,
                timeout,
            )
        };
        if n == -1 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Error::PollerWait(e));
        }
        unsafe { self.events.set_len(n as usize) };

        for i in 0..n as usize {
            let ev = self.events[i];
            let fd = ev.ident as i32;
            if fd == self.pipe_r {
                let mut buf = [0u8; 64];
                while unsafe { libc::read(self.pipe_r, buf.as_mut_ptr() as *mut _, buf.len()) } > 0
                {
                }
                continue;
            }
            let Some(state) = self.registry.get_mut(&fd) else {
                continue;
            };
            match ev.filter {
                libc::EVFILT_READ => {
                    if let Some(co) = state.rco.take() {
                        ready.push(co);
                    }
                }
                libc::EVFILT_WRITE => {
                    if let Some(co) = state.wco.take() {
                        ready.push(co);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.pipe_r);
            libc::close(self.pipe_w);
            libc::close(self.kq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_interrupts_wait() {
        let (mut poller, wakeup) = Poller::new().unwrap();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            wakeup.signal();
        });

        let start = std::time::Instant::now();
        let mut ready = Vec::new();
        // Indefinite wait; only the signal can end it.
        poller.wait(None, &mut ready).unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
        t.join().unwrap();
    }

    #[test]
    fn pipe_readiness_resolves_waiter() {
        let (mut poller, _wakeup) = Poller::new().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        poller.add_event(fds[0], Dir::Read, 7).unwrap();
        assert_eq!(
            unsafe { libc::write(fds[1], b"x".as_ptr() as *const _, 1) },
            1
        );

        let mut ready = Vec::new();
        poller.wait(Some(1000), &mut ready).unwrap();
        assert_eq!(ready, vec![7]);

        // The waiter was consumed; re-arming the direction is allowed again.
        poller.add_event(fds[0], Dir::Read, 8).unwrap();
        poller.del_events(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    #[should_panic(expected = "already has a")]
    fn double_registration_panics() {
        let (mut poller, _wakeup) = Poller::new().unwrap();
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        poller.add_event(fds[0], Dir::Read, 1).unwrap();
        poller.add_event(fds[0], Dir::Read, 2).unwrap();
    }

    #[test]
    fn timed_wait_returns() {
        let (mut poller, _wakeup) = Poller::new().unwrap();
        let start = std::time::Instant::now();
        let mut ready = Vec::new();
        poller.wait(Some(10), &mut ready).unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(10));
        assert!(ready.is_empty());
    }
}
