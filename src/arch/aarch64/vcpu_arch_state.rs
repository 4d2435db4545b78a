//! Per-VCPU private architectural state.
//!
//! EL1 system registers, the virtual timer, the GIC virtual CPU interface
//! and pointer-auth keys. None of this is part of the trap frame; the
//! scheduler saves and restores it around context switches.

use super::defs::*;

#[cfg(hv_bare_metal)]
use core::arch::asm;

/// Per-VCPU architectural state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VcpuArchState {
    // GIC virtual interface
    pub ich_lr: [u64; NUM_LRS],
    pub ich_vmcr: u64,
    pub ich_hcr: u64,

    // Virtual timer
    pub cntv_ctl_el0: u64,
    pub cntv_cval_el0: u64,

    // Trap configuration and identity
    pub hcr_el2: u64,
    pub vmpidr_el2: u64,

    // EL1 system registers
    pub sctlr_el1: u64,
    pub ttbr0_el1: u64,
    pub ttbr1_el1: u64,
    pub tcr_el1: u64,
    pub mair_el1: u64,
    pub vbar_el1: u64,
    pub cpacr_el1: u64,
    pub contextidr_el1: u64,
    pub tpidr_el1: u64,
    pub tpidrro_el0: u64,
    pub tpidr_el0: u64,
    pub par_el1: u64,
    pub cntkctl_el1: u64,
    pub sp_el1: u64,
    pub elr_el1: u64,
    pub spsr_el1: u64,
    pub afsr0_el1: u64,
    pub afsr1_el1: u64,
    pub esr_el1: u64,
    pub far_el1: u64,
    pub amair_el1: u64,
    pub mdscr_el1: u64,
    pub sp_el0: u64,

    // Pointer Authentication keys, lo/hi pairs: IA, IB, DA, DB, GA
    pub pac_keys: [u64; 10],
}

impl VcpuArchState {
    /// Reset state for VCPU `subid` of a guest
    ///
    /// `mpidr` is the host MPIDR used as a template for the affinity fields
    /// above Aff0.
    pub fn init_for_vcpu(&mut self, subid: u32, mpidr: u64, big_endian: bool) {
        *self = Self::default();
        self.vmpidr_el2 = (mpidr & !0xFF) | (subid as u64 & 0xFF);
        self.hcr_el2 = HCR_GUEST_FLAGS;
        self.ich_hcr = ICH_HCR_TALL1 | ICH_HCR_EN;
        self.ich_vmcr = ICH_VMCR_DEFAULT;
        self.sctlr_el1 = SCTLR_EL1_RES1;
        if big_endian {
            self.sctlr_el1 |= SCTLR_EE | SCTLR_E0E;
        }
    }

    /// Whether the guest's current exception level does big-endian data accesses
    pub fn data_big_endian(&self, pstate: u64) -> bool {
        if pstate & PSR_MODE_MASK == PSR_MODE_EL0T {
            self.sctlr_el1 & SCTLR_E0E != 0
        } else {
            self.sctlr_el1 & SCTLR_EE != 0
        }
    }

    /// First list register slot that holds nothing
    pub fn free_lr(&self) -> Option<usize> {
        self.ich_lr
            .iter()
            .position(|lr| (lr >> LR_STATE_SHIFT) & LR_STATE_MASK == 0)
    }

    /// List register slot currently holding `intid`
    pub fn lr_for(&self, intid: u32) -> Option<usize> {
        self.ich_lr.iter().position(|lr| {
            (lr >> LR_STATE_SHIFT) & LR_STATE_MASK != 0 && (lr & LR_VINTID_MASK) as u32 == intid
        })
    }
}

#[cfg(hv_bare_metal)]
macro_rules! save_sysregs {
    ($state:ident, $($reg:ident),* $(,)?) => {
        $( asm!(concat!("mrs {}, ", stringify!($reg)), out(reg) $state.$reg, options(nostack, nomem)); )*
    };
}

#[cfg(hv_bare_metal)]
macro_rules! restore_sysregs {
    ($state:ident, $($reg:ident),* $(,)?) => {
        $( asm!(concat!("msr ", stringify!($reg), ", {}"), in(reg) $state.$reg, options(nostack, nomem)); )*
    };
}

#[cfg(hv_bare_metal)]
impl VcpuArchState {
    /// Save all per-VCPU registers from hardware
    pub fn save(&mut self) {
        let s = self;
        unsafe {
            asm!("mrs {}, ICH_LR0_EL2", out(reg) s.ich_lr[0], options(nostack, nomem));
            asm!("mrs {}, ICH_LR1_EL2", out(reg) s.ich_lr[1], options(nostack, nomem));
            asm!("mrs {}, ICH_LR2_EL2", out(reg) s.ich_lr[2], options(nostack, nomem));
            asm!("mrs {}, ICH_LR3_EL2", out(reg) s.ich_lr[3], options(nostack, nomem));
            asm!("mrs {}, ICH_VMCR_EL2", out(reg) s.ich_vmcr, options(nostack, nomem));
            asm!("mrs {}, ICH_HCR_EL2", out(reg) s.ich_hcr, options(nostack, nomem));
            save_sysregs!(
                s, cntv_ctl_el0, cntv_cval_el0, hcr_el2, vmpidr_el2, sctlr_el1, ttbr0_el1,
                ttbr1_el1, tcr_el1, mair_el1, vbar_el1, cpacr_el1, contextidr_el1, tpidr_el1,
                tpidrro_el0, tpidr_el0, par_el1, cntkctl_el1, sp_el1, elr_el1, spsr_el1,
                afsr0_el1, afsr1_el1, esr_el1, far_el1, amair_el1, mdscr_el1, sp_el0,
            );
            let k = &mut s.pac_keys;
            asm!("mrs {}, S3_0_C2_C1_0", out(reg) k[0], options(nostack, nomem));
            asm!("mrs {}, S3_0_C2_C1_1", out(reg) k[1], options(nostack, nomem));
            asm!("mrs {}, S3_0_C2_C1_2", out(reg) k[2], options(nostack, nomem));
            asm!("mrs {}, S3_0_C2_C1_3", out(reg) k[3], options(nostack, nomem));
            asm!("mrs {}, S3_0_C2_C2_0", out(reg) k[4], options(nostack, nomem));
            asm!("mrs {}, S3_0_C2_C2_1", out(reg) k[5], options(nostack, nomem));
            asm!("mrs {}, S3_0_C2_C2_2", out(reg) k[6], options(nostack, nomem));
            asm!("mrs {}, S3_0_C2_C2_3", out(reg) k[7], options(nostack, nomem));
            asm!("mrs {}, S3_0_C2_C3_0", out(reg) k[8], options(nostack, nomem));
            asm!("mrs {}, S3_0_C2_C3_1", out(reg) k[9], options(nostack, nomem));
        }
    }

    /// Restore all per-VCPU registers to hardware
    pub fn restore(&self) {
        let s = self;
        unsafe {
            asm!("msr ICH_LR0_EL2, {}", in(reg) s.ich_lr[0], options(nostack, nomem));
            asm!("msr ICH_LR1_EL2, {}", in(reg) s.ich_lr[1], options(nostack, nomem));
            asm!("msr ICH_LR2_EL2, {}", in(reg) s.ich_lr[2], options(nostack, nomem));
            asm!("msr ICH_LR3_EL2, {}", in(reg) s.ich_lr[3], options(nostack, nomem));
            asm!("msr ICH_VMCR_EL2, {}", in(reg) s.ich_vmcr, options(nostack, nomem));
            asm!("msr ICH_HCR_EL2, {}", in(reg) s.ich_hcr, options(nostack, nomem));
            restore_sysregs!(
                s, cntv_ctl_el0, cntv_cval_el0, hcr_el2, vmpidr_el2, sctlr_el1, ttbr0_el1,
                ttbr1_el1, tcr_el1, mair_el1, vbar_el1, cpacr_el1, contextidr_el1, tpidr_el1,
                tpidrro_el0, tpidr_el0, par_el1, cntkctl_el1, sp_el1, elr_el1, spsr_el1,
                afsr0_el1, afsr1_el1, esr_el1, far_el1, amair_el1, mdscr_el1, sp_el0,
            );
            let k = &s.pac_keys;
            asm!("msr S3_0_C2_C1_0, {}", in(reg) k[0], options(nostack, nomem));
            asm!("msr S3_0_C2_C1_1, {}", in(reg) k[1], options(nostack, nomem));
            asm!("msr S3_0_C2_C1_2, {}", in(reg) k[2], options(nostack, nomem));
            asm!("msr S3_0_C2_C1_3, {}", in(reg) k[3], options(nostack, nomem));
            asm!("msr S3_0_C2_C2_0, {}", in(reg) k[4], options(nostack, nomem));
            asm!("msr S3_0_C2_C2_1, {}", in(reg) k[5], options(nostack, nomem));
            asm!("msr S3_0_C2_C2_2, {}", in(reg) k[6], options(nostack, nomem));
            asm!("msr S3_0_C2_C2_3, {}", in(reg) k[7], options(nostack, nomem));
            asm!("msr S3_0_C2_C3_0, {}", in(reg) k[8], options(nostack, nomem));
            asm!("msr S3_0_C2_C3_1, {}", in(reg) k[9], options(nostack, nomem));
            asm!("isb", options(nostack, nomem));
        }
    }
}
