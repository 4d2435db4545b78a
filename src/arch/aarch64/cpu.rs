//! EL2 register access and barriers.
//!
//! Only built for bare-metal AArch64; hosted builds use the fallbacks in
//! `arch::intrinsics` and the shadow banks of `hosted::HostedAarch64`.

use core::arch::asm;

use super::defs::*;

/// Mask IRQs and return the previous DAIF value
#[inline]
pub fn irq_save() -> usize {
    let daif: usize;
    unsafe {
        asm!("mrs {}, daif", "msr daifset, #2", out(reg) daif, options(nostack, nomem));
    }
    daif
}

#[inline]
pub fn irq_restore(flags: usize) {
    unsafe { asm!("msr daif, {}", in(reg) flags, options(nostack, nomem)) };
}

#[inline]
pub fn smp_mb() {
    unsafe { asm!("dmb ish", options(nostack)) };
}

#[inline]
pub fn smp_wmb() {
    unsafe { asm!("dmb ishst", options(nostack)) };
}

#[inline]
pub fn smp_rmb() {
    unsafe { asm!("dmb ishld", options(nostack)) };
}

#[inline]
pub fn wait_for_interrupt() {
    unsafe { asm!("dsb sy", "wfi", options(nostack, nomem)) };
}

/// Wake cores parked in WFE
#[inline]
pub fn send_event() {
    unsafe { asm!("sev", options(nostack, nomem)) };
}

/// Read the physical counter
pub fn read_counter() -> u64 {
    let count: u64;
    unsafe { asm!("isb", "mrs {}, cntpct_el0", out(reg) count, options(nostack, nomem)) };
    count
}

/// Read the counter frequency
pub fn counter_freq() -> u64 {
    let freq: u64;
    unsafe { asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nostack, nomem)) };
    freq
}

/// Read current physical CPU ID from MPIDR_EL1.Aff0
#[inline(always)]
pub fn current_cpu_id() -> usize {
    (read_mpidr() & 0xFF) as usize
}

pub fn read_mpidr() -> u64 {
    let mpidr: u64;
    unsafe { asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nostack, nomem)) };
    mpidr
}

/// Clean and invalidate data cache lines covering `[start, end)`
pub fn flush_dcache_range(start: usize, end: usize) {
    const LINE: usize = 64;
    let mut addr = start & !(LINE - 1);
    while addr < end {
        unsafe { asm!("dc civac, {}", in(reg) addr, options(nostack)) };
        addr += LINE;
    }
    unsafe { asm!("dsb sy", options(nostack)) };
}

/// Load VTCR/VTTBR/HCR for a guest, or turn stage-2 off
pub fn write_stage2(vttbr: u64, vtcr: u64, hcr: u64) {
    unsafe {
        asm!(
            "msr vtcr_el2, {vtcr}",
            "msr vttbr_el2, {vttbr}",
            "msr hcr_el2, {hcr}",
            "isb",
            vtcr = in(reg) vtcr,
            vttbr = in(reg) vttbr,
            hcr = in(reg) hcr,
            options(nostack, nomem),
        );
    }
}

/// Invalidate a single IPA of the currently loaded VMID, all CPUs
pub fn tlbi_ipa_is(ipa: u64) {
    let ipa_shifted = (ipa >> 12) & 0x0000_00FF_FFFF_FFFF;
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi ipas2e1is, {ipa}",
            "dsb ish",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            ipa = in(reg) ipa_shifted,
            options(nostack),
        );
    }
}

/// Invalidate all stage-1 and stage-2 entries of the currently loaded VMID
pub fn tlbi_vmid_is() {
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vmalls12e1is",
            "dsb ish",
            "isb",
            options(nostack),
        );
    }
}

pub fn read_vttbr() -> u64 {
    let v: u64;
    unsafe { asm!("mrs {}, vttbr_el2", out(reg) v, options(nostack, nomem)) };
    v
}

/// Temporarily load `vttbr` (for TLB maintenance of another VMID)
pub fn write_vttbr(v: u64) {
    unsafe { asm!("msr vttbr_el2, {}", "isb", in(reg) v, options(nostack, nomem)) };
}

/// SMC into firmware with PSCI calling convention
pub fn psci_call(fid: u64) -> u64 {
    let ret: u64;
    unsafe {
        asm!("smc #0", inlateout("x0") fid => ret, options(nostack));
    }
    ret
}

/// Program the EL2 physical timer `ticks` cycles from now
pub fn cnthp_arm(ticks: u64) {
    unsafe {
        asm!(
            "msr cnthp_tval_el2, {t}",
            "msr cnthp_ctl_el2, {ctl}",
            "isb",
            t = in(reg) ticks,
            ctl = in(reg) CNT_CTL_ENABLE,
            options(nostack, nomem),
        );
    }
}

pub fn cnthp_disable() {
    unsafe { asm!("msr cnthp_ctl_el2, {}", "isb", in(reg) CNT_CTL_IMASK, options(nostack, nomem)) };
}

macro_rules! sysreg_accessors {
    ($($get:ident, $set:ident => $reg:literal;)*) => {
        $(
            pub fn $get() -> u64 {
                let v: u64;
                unsafe { asm!(concat!("mrs {}, ", $reg), out(reg) v, options(nostack, nomem)) };
                v
            }

            pub fn $set(v: u64) {
                unsafe { asm!(concat!("msr ", $reg, ", {}"), in(reg) v, options(nostack, nomem)) };
            }
        )*
    };
}

sysreg_accessors! {
    read_esr_el1, write_esr_el1 => "esr_el1";
    read_far_el1, write_far_el1 => "far_el1";
    read_elr_el1, write_elr_el1 => "elr_el1";
    read_spsr_el1, write_spsr_el1 => "spsr_el1";
    read_vbar_el1, write_vbar_el1 => "vbar_el1";
    read_sctlr_el1, write_sctlr_el1 => "sctlr_el1";
}

/// List registers are not indexable; route by slot number.
pub fn read_lr(slot: usize) -> u64 {
    let v: u64;
    unsafe {
        match slot {
            0 => asm!("mrs {}, ICH_LR0_EL2", out(reg) v, options(nostack, nomem)),
            1 => asm!("mrs {}, ICH_LR1_EL2", out(reg) v, options(nostack, nomem)),
            2 => asm!("mrs {}, ICH_LR2_EL2", out(reg) v, options(nostack, nomem)),
            _ => asm!("mrs {}, ICH_LR3_EL2", out(reg) v, options(nostack, nomem)),
        }
    }
    v
}

pub fn write_lr(slot: usize, v: u64) {
    unsafe {
        match slot {
            0 => asm!("msr ICH_LR0_EL2, {}", in(reg) v, options(nostack, nomem)),
            1 => asm!("msr ICH_LR1_EL2, {}", in(reg) v, options(nostack, nomem)),
            2 => asm!("msr ICH_LR2_EL2, {}", in(reg) v, options(nostack, nomem)),
            _ => asm!("msr ICH_LR3_EL2, {}", in(reg) v, options(nostack, nomem)),
        }
    }
}

const _: () = assert!(NUM_LRS == 4);
