//! x86_64 System V implementation.
//!
//! Only the callee-saved registers need to be preserved across a cooperative
//! switch; everything else is dead at the call boundary. The resume address
//! lives on the suspended stack itself: `switch` returns into the target via
//! `ret`, so a fresh context simply plants the trampoline address where `ret`
//! will pop it.

use core::arch::naked_asm;

use super::Entry;

#[repr(C)]
#[derive(Default)]
pub(crate) struct Context {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

impl Context {
    /// Builds a context that enters `entry(arg)` on the given stack when
    /// first switched to.
    ///
    /// The entry function and its argument ride in `rbx`/`r12`; the
    /// trampoline moves them into place. The synthetic frame is laid out so
    /// that the trampoline observes the stack alignment the SysV ABI
    /// guarantees at a function's first instruction.
    ///
    /// # Safety
    /// `stack_top` must be the one-past-the-end address of a writable region
    /// large enough to run `entry`.
    pub unsafe fn fresh(stack_top: *mut u8, entry: Entry, arg: *mut ()) -> Self {
        let top = (stack_top as u64) & !15;
        let rsp = top - 8;
        *(rsp as *mut u64) = trampoline as usize as u64;
        Context {
            rsp,
            rbx: entry as usize as u64,
            r12: arg as u64,
            ..Context::default()
        }
    }

    /// The saved stack pointer. Valid only for a suspended context.
    pub fn sp(&self) -> usize {
        self.rsp as usize
    }
}

/// Saves the callee-saved set into `save`, restores `load`, and returns into
/// the restored context.
///
/// # Safety
/// Both pointers must be valid; `load` must be a context produced by a prior
/// `switch` save or by [`Context::fresh`] over a live stack.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn switch(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ret",
    )
}

// First instructions ever executed on a coroutine stack: forward the argument
// and call the entry. The entry must switch away instead of returning; the
// trap below catches a contract violation.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm!("mov rdi, r12", "call rbx", "ud2")
}
