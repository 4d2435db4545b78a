//! ARM64/AArch64 architecture support
//!
//! - Register definitions and the trap frame
//! - Per-VCPU private EL1/GIC/timer state
//! - Stage-2 descriptor format
//! - Trap classification, MMIO decode and guest exception injection
//! - Host GIC and generic timer drivers
//! - Two `VcpuArch` backends: `native` drives EL2 hardware, `hosted`
//!   keeps per-CPU shadow register banks so the core runs in unit tests

pub mod defs;
pub mod hosted;
pub mod hypervisor;
pub mod mm;
pub mod peripherals;
pub mod regs;
pub mod vcpu_arch_state;

#[cfg(hv_bare_metal)]
pub mod cpu;
#[cfg(hv_bare_metal)]
pub mod native;

pub use regs::*;
pub use vcpu_arch_state::VcpuArchState;

use crate::arch::traits::{VcpuInit, VcpuKind};
use defs::{SPSR_EL1H_DAIF_MASKED, SPSR_EL2H_IRQ_ON};

/// Shared reset logic of both backends
///
/// Guest VCPUs start in EL1h with interrupts masked; orphans start in EL2h
/// with IRQs unmasked on their own stack.
pub(crate) fn reset_vcpu(init: &VcpuInit, mpidr: u64, regs: &mut VcpuRegs, state: &mut VcpuArchState) {
    match init.kind {
        VcpuKind::Normal => {
            *regs = VcpuRegs::new(init.start_pc, init.stack_top, SPSR_EL1H_DAIF_MASKED);
            state.init_for_vcpu(init.subid, mpidr, init.big_endian);
        }
        VcpuKind::Orphan => {
            *regs = VcpuRegs::new(init.start_pc, init.stack_top, SPSR_EL2H_IRQ_ON);
            *state = VcpuArchState::default();
        }
    }
}
