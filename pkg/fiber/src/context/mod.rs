//! Architecture-specific stack switching.
//!
//! A [`Context`] is the callee-saved register set of a suspended coroutine
//! (plus its stack pointer and resume address). [`switch`] saves the current
//! registers into one context and restores another; [`Context::fresh`] builds
//! a context that enters the coroutine trampoline on its first switch, with a
//! caller-chosen argument delivered through a callee-saved register.
//!
//! The trampoline never returns: the runtime's coroutine entry function is
//! expected to switch back to the scheduler context when the body is done.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::{switch, Context};

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::{switch, Context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("stack switching is only implemented for x86_64 and aarch64");

/// Entry signature of the coroutine trampoline target.
pub(crate) type Entry = extern "C" fn(*mut ());

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        main: Context,
        coro: Context,
        hits: u32,
    }

    extern "C" fn entry(arg: *mut ()) {
        let h = unsafe { &mut *(arg as *mut Harness) };
        h.hits += 1;
        unsafe { switch(&mut h.coro, &h.main) };
        // Resumed a second time.
        h.hits += 10;
        unsafe { switch(&mut h.coro, &h.main) };
        unreachable!();
    }

    #[test]
    fn switch_round_trip() {
        // A plain heap buffer is good enough here; fresh() aligns the top.
        let mut stack = vec![0u8; 64 * 1024];
        let top = unsafe { stack.as_mut_ptr().add(stack.len()) };

        let p = Box::into_raw(Box::new(Harness {
            main: Context::default(),
            coro: Context::default(),
            hits: 0,
        }));
        unsafe {
            (*p).coro = Context::fresh(top, entry, p as *mut ());

            switch(&mut (*p).main, &(*p).coro);
            assert_eq!((*p).hits, 1);
            // The saved stack pointer must lie inside the stack we handed
            // over.
            let sp = (*p).coro.sp();
            assert!(sp > stack.as_ptr() as usize && sp <= top as usize);

            switch(&mut (*p).main, &(*p).coro);
            assert_eq!((*p).hits, 11);

            drop(Box::from_raw(p));
        }
    }
}
