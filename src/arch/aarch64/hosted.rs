//! Hosted AArch64 backend.
//!
//! Everything a real EL2 would keep in system registers lives in a per-CPU
//! shadow bank instead. The guest-visible effects (exception entry, list
//! register contents, endianness) are computed by the same pure functions
//! the native backend uses, so the core's behaviour can be checked on any
//! host.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use log::trace;

use super::defs::*;
use super::hypervisor::inject::{inject_sync, queue_virq, withdraw_virq};
use super::{VcpuArchState, VcpuRegs};
use crate::arch::intrinsics;
use crate::arch::traits::{FirmwareCall, GuestException, Stage2Root, TlbScope, VcpuArch, VcpuInit};
use crate::error::Result;
use crate::sync::SpinLock;

/// MPIDR template handed to guests; Aff0 is replaced by the VCPU index
const HOSTED_MPIDR: u64 = 0x8000_0000;

/// Shadow of one host CPU's EL2-controlled state
#[derive(Clone, Copy, Debug, Default)]
pub struct HostedCpu {
    pub live: VcpuArchState,
    pub stage2: Option<Stage2Root>,
    pub wfi_count: u64,
    pub kicks: u64,
}

pub struct HostedAarch64 {
    cpus: Vec<SpinLock<HostedCpu>>,
    tlb_flushes: AtomicU64,
    firmware: SpinLock<Vec<FirmwareCall>>,
}

impl HostedAarch64 {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            cpus: (0..nr_cpus.max(1)).map(|_| SpinLock::new(HostedCpu::default())).collect(),
            tlb_flushes: AtomicU64::new(0),
            firmware: SpinLock::new(Vec::new()),
        }
    }

    fn cpu(&self, cpu: usize) -> &SpinLock<HostedCpu> {
        &self.cpus[cpu % self.cpus.len()]
    }

    /// Snapshot of a host CPU's shadow bank
    pub fn cpu_state(&self, cpu: usize) -> HostedCpu {
        *self.cpu(cpu).lock()
    }

    /// Private state currently loaded on `cpu`
    pub fn live_state(&self, cpu: usize) -> VcpuArchState {
        self.cpu(cpu).lock().live
    }

    /// Modify the loaded private state, as the running guest would
    pub fn with_live<R>(&self, cpu: usize, f: impl FnOnce(&mut VcpuArchState) -> R) -> R {
        f(&mut self.cpu(cpu).lock().live)
    }

    /// Guest acknowledged and completed `intid`: its list register empties
    pub fn complete_virq(&self, cpu: usize, intid: u32) {
        let mut c = self.cpu(cpu).lock();
        if let Some(slot) = c.live.lr_for(intid) {
            c.live.ich_lr[slot] = 0;
        }
    }

    pub fn tlb_flushes(&self) -> u64 {
        self.tlb_flushes.load(Ordering::Relaxed)
    }

    pub fn firmware_calls(&self) -> Vec<FirmwareCall> {
        self.firmware.lock().clone()
    }
}

impl VcpuArch for HostedAarch64 {
    fn name(&self) -> &'static str {
        "aarch64-hosted"
    }

    fn vcpu_init(&self, init: &VcpuInit, regs: &mut VcpuRegs, state: &mut VcpuArchState) -> Result {
        super::reset_vcpu(init, HOSTED_MPIDR, regs, state);
        Ok(())
    }

    fn save_private(&self, cpu: usize, state: &mut VcpuArchState) {
        *state = self.cpu(cpu).lock().live;
    }

    fn restore_private(&self, cpu: usize, state: &VcpuArchState) {
        self.cpu(cpu).lock().live = *state;
    }

    fn switch_stage2(&self, cpu: usize, root: Option<Stage2Root>) {
        trace!("cpu{}: stage2 -> {:?}", cpu, root);
        self.cpu(cpu).lock().stage2 = root;
    }

    fn tlb_invalidate(&self, _cpu: usize, scope: TlbScope) {
        trace!("tlbi {:?}", scope);
        intrinsics::smp_mb();
        self.tlb_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn irq_priority(&self, irq: u32) -> u32 {
        GIC_SPURIOUS_INTID.saturating_sub(irq)
    }

    fn irq_execute(&self, cpu: usize, _regs: &mut VcpuRegs, irq: u32, _reason: u32) -> Result {
        queue_virq(&mut self.cpu(cpu).lock().live, irq, IRQ_DEFAULT_PRIORITY)
    }

    fn irq_withdraw(&self, cpu: usize, irq: u32) {
        withdraw_virq(&mut self.cpu(cpu).lock().live, irq);
    }

    fn inject_exception(&self, cpu: usize, regs: &mut VcpuRegs, exc: &GuestException) -> Result {
        inject_sync(regs, &mut self.cpu(cpu).lock().live, exc);
        Ok(())
    }

    fn guest_big_endian(&self, cpu: usize, regs: &VcpuRegs) -> bool {
        self.cpu(cpu).lock().live.data_big_endian(regs.pstate)
    }

    fn wait_for_interrupt(&self, cpu: usize) {
        self.cpu(cpu).lock().wfi_count += 1;
        intrinsics::wait_for_interrupt();
    }

    fn kick_cpu(&self, cpu: usize) {
        self.cpu(cpu).lock().kicks += 1;
    }

    fn firmware_call(&self, call: FirmwareCall) -> Result {
        self.firmware.lock().push(call);
        Ok(())
    }
}
