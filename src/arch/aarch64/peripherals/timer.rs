//! ARM Generic Timer support
//!
//! - The physical counter (CNTPCT_EL0) is the host clocksource
//! - The EL2 physical timer (CNTHP_*) is each CPU's clockchip, PPI 26
//!
//! Guests keep their virtual timer (CNTV_*), which is part of the private
//! state switched by the backend.

use core::arch::asm;

use crate::arch::aarch64::cpu;
use crate::arch::aarch64::defs::{CNTHCTL_EL1PCEN, CNTHCTL_EL1PCTEN, CNTHP_INTID};
use crate::arch::traits::{ClockChip, ClockSource};
use crate::clocksource::{calc_mult_shift, NSEC_PER_SEC};
use crate::error::Result;

/// The architecture guarantees at least 56 counter bits
const COUNTER_MASK: u64 = (1 << 56) - 1;

/// Largest value the 32-bit TVAL register takes as a countdown
const TVAL_MAX: u64 = 0x7FFF_FFFF;

pub struct GenericCounter {
    freq: u64,
    mult: u32,
    shift: u32,
}

impl GenericCounter {
    pub fn new() -> Self {
        let freq = cpu::counter_freq();
        let (mult, shift) = calc_mult_shift(freq, NSEC_PER_SEC, 3600);
        Self { freq, mult, shift }
    }

    pub fn frequency(&self) -> u64 {
        self.freq
    }
}

impl Default for GenericCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for GenericCounter {
    fn name(&self) -> &str {
        "arch-counter"
    }

    fn rating(&self) -> u32 {
        400
    }

    fn read(&self) -> u64 {
        cpu::read_counter()
    }

    fn mask(&self) -> u64 {
        COUNTER_MASK
    }

    fn mult(&self) -> u32 {
        self.mult
    }

    fn shift(&self) -> u32 {
        self.shift
    }
}

/// EL2 physical timer of the executing CPU
pub struct HypTimer {
    mult: u32,
    shift: u32,
    max_delta_ns: u64,
}

impl HypTimer {
    pub fn new() -> Self {
        let freq = cpu::counter_freq();
        let (mult, shift) = calc_mult_shift(NSEC_PER_SEC, freq, 10);
        Self {
            mult,
            shift,
            max_delta_ns: TVAL_MAX * NSEC_PER_SEC / freq.max(1),
        }
    }

    /// Let EL1 read the physical counter and program its own timers
    pub fn init_hypervisor_timer() {
        let mut cnthctl: u64;
        unsafe {
            asm!("mrs {}, cnthctl_el2", out(reg) cnthctl, options(nostack, nomem));
        }
        cnthctl |= CNTHCTL_EL1PCTEN | CNTHCTL_EL1PCEN;
        unsafe {
            asm!("msr cnthctl_el2, {}", in(reg) cnthctl, options(nostack, nomem));
        }
    }
}

impl Default for HypTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockChip for HypTimer {
    fn name(&self) -> &str {
        "el2-phys-timer"
    }

    fn hirq(&self) -> u32 {
        CNTHP_INTID
    }

    fn mult(&self) -> u32 {
        self.mult
    }

    fn shift(&self) -> u32 {
        self.shift
    }

    fn min_delta_ns(&self) -> u64 {
        1000
    }

    fn max_delta_ns(&self) -> u64 {
        self.max_delta_ns
    }

    fn set_next_event(&self, cycles: u64) -> Result {
        cpu::cnthp_arm(cycles.min(TVAL_MAX));
        Ok(())
    }

    fn shutdown(&self) {
        cpu::cnthp_disable();
    }
}
