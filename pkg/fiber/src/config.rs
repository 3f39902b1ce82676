//! Runtime configuration.
//!
//! Values may be set programmatically before the schedulers start, or through
//! the environment (`FIBER_SCHED_NUM`, `FIBER_STACK_NUM`, `FIBER_STACK_SIZE`).
//! The scheduler manager snapshots them exactly once on first use; changes
//! made after that point have no effect.

use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_STACK_NUM: usize = 8;
const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

// 0 means "unset, resolve from env then defaults".
static SCHED_NUM: AtomicUsize = AtomicUsize::new(0);
static STACK_NUM: AtomicUsize = AtomicUsize::new(0);
static STACK_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Number of schedulers to start. Values of 0 or above the CPU count fall
/// back to the CPU count.
pub fn set_sched_num(n: usize) {
    SCHED_NUM.store(n, Ordering::Relaxed);
}

/// Number of shared stacks per scheduler. Must be a power of two; invalid
/// values fall back to 8.
pub fn set_stack_num(n: usize) {
    STACK_NUM.store(n, Ordering::Relaxed);
}

/// Size in bytes of each shared coroutine stack. 0 falls back to 1 MiB.
pub fn set_stack_size(n: usize) {
    STACK_SIZE.store(n, Ordering::Relaxed);
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Config {
    pub sched_num: usize,
    pub stack_num: usize,
    pub stack_size: usize,
}

fn from_env(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn resolve(slot: &AtomicUsize, env: &str) -> usize {
    match slot.load(Ordering::Relaxed) {
        0 => from_env(env).unwrap_or(0),
        n => n,
    }
}

/// Reads and validates the configuration. Called once when the scheduler
/// manager initializes.
pub(crate) fn snapshot() -> Config {
    let ncpu = num_cpus::get().max(1);

    let mut sched_num = resolve(&SCHED_NUM, "FIBER_SCHED_NUM");
    if sched_num == 0 || sched_num > ncpu {
        sched_num = ncpu;
    }

    let mut stack_num = resolve(&STACK_NUM, "FIBER_STACK_NUM");
    if stack_num == 0 || !stack_num.is_power_of_two() {
        stack_num = DEFAULT_STACK_NUM;
    }

    let mut stack_size = resolve(&STACK_SIZE, "FIBER_STACK_SIZE");
    if stack_size == 0 {
        stack_size = DEFAULT_STACK_SIZE;
    }
    // The context switch requires 16-byte stack alignment on every target we
    // support; round up so the top is always aligned.
    stack_size = (stack_size + 15) & !15;

    Config {
        sched_num,
        stack_num,
        stack_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_values_fall_back() {
        // Defaults resolve when nothing is set.
        let c = snapshot();
        assert!(c.sched_num >= 1);
        assert!(c.stack_num.is_power_of_two());
        assert!(c.stack_size >= 4096);

        set_stack_num(7); // not a power of two
        let c = snapshot();
        assert_eq!(c.stack_num, DEFAULT_STACK_NUM);
        set_stack_num(0);

        set_sched_num(usize::MAX); // above cpu count
        let c = snapshot();
        assert_eq!(c.sched_num, num_cpus::get().max(1));
        set_sched_num(0);
    }
}
