//! CPU intrinsics used by portable code.
//!
//! On bare-metal AArch64 these are inline assembly from `aarch64::cpu`.
//! Hosted builds get fallbacks built on `core::sync::atomic` so the core can
//! run under a unit-test harness.

use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(hv_bare_metal)]
pub use super::aarch64::cpu::{
    counter_freq, current_cpu_id, flush_dcache_range, irq_restore, irq_save, read_counter,
    send_event, smp_mb, smp_rmb, smp_wmb, wait_for_interrupt,
};

#[cfg(not(hv_bare_metal))]
pub use self::portable::*;

/// Compare-and-exchange of a 64-bit word; returns the previous value
pub fn cmpxchg(word: &AtomicU64, old: u64, new: u64) -> u64 {
    match word.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(prev) | Err(prev) => prev,
    }
}

#[cfg(not(hv_bare_metal))]
mod portable {
    use core::sync::atomic::{fence, AtomicU64, Ordering};

    static SOFT_COUNTER: AtomicU64 = AtomicU64::new(0);

    #[cfg(test)]
    std::thread_local! {
        static IRQ_MASKED: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
    }

    /// Interrupts are never delivered asynchronously in hosted builds.
    /// Unit tests still track the mask per thread.
    #[inline]
    pub fn irq_save() -> usize {
        #[cfg(test)]
        {
            IRQ_MASKED.with(|m| m.replace(true) as usize)
        }
        #[cfg(not(test))]
        {
            0
        }
    }

    #[inline]
    pub fn irq_restore(flags: usize) {
        #[cfg(test)]
        IRQ_MASKED.with(|m| m.set(flags != 0));
        #[cfg(not(test))]
        let _ = flags;
    }

    #[cfg(test)]
    pub fn irqs_disabled() -> bool {
        IRQ_MASKED.with(|m| m.get())
    }

    #[inline]
    pub fn smp_mb() {
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn smp_wmb() {
        fence(Ordering::Release);
    }

    #[inline]
    pub fn smp_rmb() {
        fence(Ordering::Acquire);
    }

    #[inline]
    pub fn wait_for_interrupt() {
        core::hint::spin_loop();
    }

    #[inline]
    pub fn send_event() {}

    /// Software counter ticking once per read
    pub fn read_counter() -> u64 {
        SOFT_COUNTER.fetch_add(1, Ordering::Relaxed)
    }

    pub fn counter_freq() -> u64 {
        1_000_000_000
    }

    pub fn current_cpu_id() -> usize {
        0
    }

    pub fn flush_dcache_range(_start: usize, _end: usize) {
        fence(Ordering::SeqCst);
    }
}
