//! Shared coroutine stacks.
//!
//! Each scheduler owns a small, fixed set of stack slots; many coroutines
//! share one slot over time. Exactly one coroutine occupies a slot physically
//! at any instant. When another coroutine needs the slot, the live top region
//! of the occupant (`[sp, top)`) is copied into that coroutine's private
//! buffer and copied back, to the same addresses, before it next runs, so
//! pointers into the stack stay valid across the swap.

use std::io;
use std::ptr;

use crate::error::{Error, Result};

const GUARD_SIZE: usize = 4096;

/// A fixed-size stack region, `mmap`ed on first use with a `PROT_NONE` guard
/// page at the bottom so overflow faults instead of corrupting memory.
pub(crate) struct StackSlot {
    base: *mut u8,
    size: usize,
    /// Coroutine whose frames currently sit on this stack.
    pub owner: Option<u32>,
}

// Stack memory is only touched by the scheduler thread that owns the slot.
unsafe impl Send for StackSlot {}

impl StackSlot {
    pub const fn unmapped() -> Self {
        StackSlot {
            base: ptr::null_mut(),
            size: 0,
            owner: None,
        }
    }

    pub fn is_mapped(&self) -> bool {
        !self.base.is_null()
    }

    /// Maps the slot's memory. Called lazily the first time a coroutine
    /// assigned to this slot is resumed.
    pub fn map(&mut self, size: usize) -> Result<()> {
        debug_assert!(!self.is_mapped());
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::StackMap(io::Error::last_os_error(), size));
        }
        if unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) } != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::munmap(base, size) };
            return Err(Error::StackMap(e, size));
        }
        self.base = base as *mut u8;
        self.size = size;
        Ok(())
    }

    /// One past the highest usable address; stacks grow down from here.
    pub fn top(&self) -> *mut u8 {
        debug_assert!(self.is_mapped());
        unsafe { self.base.add(self.size) }
    }

    /// Whether `p` points into the usable region of this stack.
    pub fn contains(&self, p: *const u8) -> bool {
        if !self.is_mapped() {
            return false;
        }
        let addr = p as usize;
        addr >= self.base as usize + GUARD_SIZE && addr < self.top() as usize
    }

    /// Copies the live top region `[sp, top)` into `buf`.
    pub fn save_into(&self, sp: usize, buf: &mut Vec<u8>) {
        let top = self.top() as usize;
        debug_assert!(sp > self.base as usize + GUARD_SIZE && sp <= top);
        buf.clear();
        unsafe {
            buf.extend_from_slice(std::slice::from_raw_parts(sp as *const u8, top - sp));
        }
    }

    /// Copies a previously saved region back to the addresses it was saved
    /// from.
    pub fn restore_from(&self, buf: &[u8]) {
        let top = self.top() as usize;
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), (top - buf.len()) as *mut u8, buf.len());
        }
    }
}

impl Drop for StackSlot {
    fn drop(&mut self) {
        if self.is_mapped() {
            unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_bounds() {
        let mut s = StackSlot::unmapped();
        assert!(!s.is_mapped());
        s.map(64 * 1024).unwrap();
        assert!(s.is_mapped());

        let top = s.top();
        assert!(s.contains(unsafe { top.sub(1) }));
        assert!(s.contains(unsafe { top.sub(60 * 1024) }));
        // Guard page and out-of-range addresses are not "on" the stack.
        assert!(!s.contains(unsafe { top.sub(64 * 1024) }));
        assert!(!s.contains(top));
    }

    #[test]
    fn save_restore_round_trip() {
        let mut s = StackSlot::unmapped();
        s.map(64 * 1024).unwrap();

        let top = s.top() as usize;
        let sp = top - 256;
        for i in 0..=255u8 {
            unsafe { *((sp + i as usize) as *mut u8) = i };
        }

        let mut buf = Vec::new();
        s.save_into(sp, &mut buf);
        assert_eq!(buf.len(), 256);

        // Scribble over the live region, then restore.
        unsafe { ptr::write_bytes(sp as *mut u8, 0xaa, 256) };
        s.restore_from(&buf);
        for i in 0..=255u8 {
            assert_eq!(unsafe { *((sp + i as usize) as *const u8) }, i);
        }
    }
}
