//! Bare-metal EL2 backend.
//!
//! Private state goes straight to and from the CPU's system registers; the
//! guest-visible transformations are shared with the hosted backend.

use alloc::sync::Arc;

use log::{error, trace};

use super::cpu;
use super::defs::*;
use super::hypervisor::inject::{inject_sync, queue_virq, withdraw_virq};
use super::{VcpuArchState, VcpuRegs};
use crate::arch::traits::{
    FirmwareCall, GuestException, HostIrqChip, Stage2Root, TlbScope, VcpuArch, VcpuInit,
};
use crate::error::{Error, Result};
use crate::percpu::CpuMask;

/// SGI used to force a remote CPU through its IRQ exit path
pub const IPI_RESCHED: u32 = 1;

pub struct Aarch64Native {
    chip: Arc<dyn HostIrqChip>,
}

impl Aarch64Native {
    pub fn new(chip: Arc<dyn HostIrqChip>) -> Self {
        Self { chip }
    }

    /// Run `f` with `vmid` temporarily loaded, for VMID-scoped TLB maintenance
    fn with_vmid(vmid: u16, f: impl FnOnce()) {
        let saved = cpu::read_vttbr();
        let tmp = (saved & VTTBR_BADDR_MASK) | ((vmid as u64) << VTTBR_VMID_SHIFT);
        let switch = tmp != saved;
        if switch {
            cpu::write_vttbr(tmp);
        }
        f();
        if switch {
            cpu::write_vttbr(saved);
        }
    }

    /// Read the LR bank into a scratch state, edit, write back
    fn edit_lrs(f: impl FnOnce(&mut VcpuArchState) -> Result) -> Result {
        let mut st = VcpuArchState::default();
        for (slot, lr) in st.ich_lr.iter_mut().enumerate() {
            *lr = cpu::read_lr(slot);
        }
        let before = st.ich_lr;
        let ret = f(&mut st);
        for (slot, (&new, &old)) in st.ich_lr.iter().zip(before.iter()).enumerate() {
            if new != old {
                cpu::write_lr(slot, new);
            }
        }
        ret
    }
}

impl VcpuArch for Aarch64Native {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn vcpu_init(&self, init: &VcpuInit, regs: &mut VcpuRegs, state: &mut VcpuArchState) -> Result {
        super::reset_vcpu(init, cpu::read_mpidr(), regs, state);
        Ok(())
    }

    fn save_private(&self, _cpu: usize, state: &mut VcpuArchState) {
        state.save();
    }

    fn restore_private(&self, _cpu: usize, state: &VcpuArchState) {
        state.restore();
    }

    fn switch_stage2(&self, cpu_id: usize, root: Option<Stage2Root>) {
        trace!("cpu{}: stage2 -> {:?}", cpu_id, root);
        match root {
            Some(root) => {
                let cfg = super::mm::mmu::Stage2Config::new_with_vmid(root.root_pa, root.vmid);
                cpu::write_stage2(cfg.vttbr, cfg.vtcr, HCR_GUEST_FLAGS);
            }
            None => cpu::write_stage2(0, VTCR_DEFAULT, HCR_RW),
        }
    }

    fn tlb_invalidate(&self, _cpu: usize, scope: TlbScope) {
        match scope {
            TlbScope::Ipa { vmid, ipa } => Self::with_vmid(vmid, || cpu::tlbi_ipa_is(ipa)),
            TlbScope::Vmid(vmid) => Self::with_vmid(vmid, cpu::tlbi_vmid_is),
        }
    }

    fn irq_priority(&self, irq: u32) -> u32 {
        GIC_SPURIOUS_INTID.saturating_sub(irq)
    }

    fn irq_execute(&self, _cpu: usize, _regs: &mut VcpuRegs, irq: u32, _reason: u32) -> Result {
        Self::edit_lrs(|st| queue_virq(st, irq, IRQ_DEFAULT_PRIORITY))
    }

    fn irq_withdraw(&self, _cpu: usize, irq: u32) {
        let _ = Self::edit_lrs(|st| {
            withdraw_virq(st, irq);
            Ok(())
        });
    }

    fn inject_exception(&self, _cpu: usize, regs: &mut VcpuRegs, exc: &GuestException) -> Result {
        let mut st = VcpuArchState {
            vbar_el1: cpu::read_vbar_el1(),
            far_el1: cpu::read_far_el1(),
            ..Default::default()
        };
        inject_sync(regs, &mut st, exc);
        cpu::write_esr_el1(st.esr_el1);
        cpu::write_far_el1(st.far_el1);
        cpu::write_elr_el1(st.elr_el1);
        cpu::write_spsr_el1(st.spsr_el1);
        Ok(())
    }

    fn guest_big_endian(&self, _cpu: usize, regs: &VcpuRegs) -> bool {
        let st = VcpuArchState {
            sctlr_el1: cpu::read_sctlr_el1(),
            ..Default::default()
        };
        st.data_big_endian(regs.pstate)
    }

    fn wait_for_interrupt(&self, _cpu: usize) {
        cpu::wait_for_interrupt();
    }

    fn kick_cpu(&self, target: usize) {
        if let Err(e) = self.chip.raise_ipi(IPI_RESCHED, CpuMask::single(target)) {
            error!("kick cpu{} failed: {}", target, e);
        }
    }

    fn firmware_call(&self, call: FirmwareCall) -> Result {
        let fid = match call {
            FirmwareCall::SystemReset => PSCI_SYSTEM_RESET,
            FirmwareCall::SystemOff => PSCI_SYSTEM_OFF,
        };
        // Only returns if firmware refused the request.
        let ret = cpu::psci_call(fid) as i64;
        error!("psci {:?} returned {}", call, ret);
        Err(Error::Unsupp)
    }
}
