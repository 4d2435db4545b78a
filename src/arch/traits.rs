//! Architecture-Portable Trait Definitions
//!
//! The hypervisor core talks to the CPU, the host interrupt controller and
//! the timer hardware only through these traits. Implementations live under
//! `arch::<name>` and are handed to the core at construction time.

use super::{VcpuArchState, VcpuRegs};
use crate::error::{Error, Result};
use crate::percpu::CpuMask;

/// Register-level access to a trap frame
pub trait VcpuContextOps {
    fn pc(&self) -> u64;
    fn set_pc(&mut self, val: u64);
    fn sp(&self) -> u64;
    fn set_sp(&mut self, val: u64);
    fn get_reg(&self, n: u8) -> u64;
    fn set_reg(&mut self, n: u8, val: u64);
    fn advance_pc(&mut self, insn_len: u64);
}

/// Whether a VCPU runs guest code or is a hypervisor thread
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuKind {
    Normal,
    Orphan,
}

/// Reset-time description of a VCPU handed to the backend
#[derive(Clone, Copy, Debug)]
pub struct VcpuInit {
    pub kind: VcpuKind,
    /// Index of the VCPU inside its guest (0 for orphans)
    pub subid: u32,
    pub start_pc: u64,
    pub stack_top: u64,
    /// Guest starts with big-endian data accesses
    pub big_endian: bool,
}

/// Root of a second-stage translation, as loaded into hardware
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage2Root {
    pub root_pa: u64,
    pub vmid: u16,
}

/// Extent of a TLB invalidation. Every scope is broadcast to all host CPUs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlbScope {
    Ipa { vmid: u16, ipa: u64 },
    Vmid(u16),
}

/// Synchronous exception delivered into a guest's exception vector
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestException {
    DataAbort { fault_addr: u64, write: bool },
    InstructionAbort { fault_addr: u64 },
    Undefined,
}

/// Platform firmware services used by board reset/shutdown
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareCall {
    SystemReset,
    SystemOff,
}

/// CPU virtualization backend.
///
/// Methods taking a `cpu` operate on the live hardware state of that host
/// CPU, which always belongs to its current VCPU. Methods taking a
/// `VcpuArchState` operate on the in-memory copy.
pub trait VcpuArch: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reset the register frame and private state of a VCPU
    fn vcpu_init(&self, init: &VcpuInit, regs: &mut VcpuRegs, state: &mut VcpuArchState) -> Result;

    fn save_private(&self, cpu: usize, state: &mut VcpuArchState);
    fn restore_private(&self, cpu: usize, state: &VcpuArchState);

    /// Load a second-stage root, or disable second-stage translation
    fn switch_stage2(&self, cpu: usize, root: Option<Stage2Root>);
    fn tlb_invalidate(&self, cpu: usize, scope: TlbScope);

    /// Larger value means more urgent
    fn irq_priority(&self, irq: u32) -> u32;
    /// Make `irq` visible to the current guest of `cpu`
    fn irq_execute(&self, cpu: usize, regs: &mut VcpuRegs, irq: u32, reason: u32) -> Result;
    /// Withdraw a not-yet-acknowledged `irq` from the current guest of `cpu`
    fn irq_withdraw(&self, cpu: usize, irq: u32);
    fn inject_exception(&self, cpu: usize, regs: &mut VcpuRegs, exc: &GuestException) -> Result;
    /// Whether the current guest of `cpu` performs big-endian data accesses
    fn guest_big_endian(&self, cpu: usize, regs: &VcpuRegs) -> bool;

    fn wait_for_interrupt(&self, cpu: usize);
    /// Force `cpu` through its IRQ exit path soon
    fn kick_cpu(&self, cpu: usize);
    fn firmware_call(&self, call: FirmwareCall) -> Result;
}

/// Host interrupt trigger type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqTrigger {
    EdgeRising,
    EdgeFalling,
    LevelHigh,
    LevelLow,
}

impl IrqTrigger {
    pub fn is_level(self) -> bool {
        matches!(self, IrqTrigger::LevelHigh | IrqTrigger::LevelLow)
    }
}

/// Host interrupt controller operations (GIC on ARM, PLIC on RISC-V)
pub trait HostIrqChip: Send + Sync {
    fn name(&self) -> &str;
    /// Number of interrupt lines handled by the chip
    fn irq_count(&self) -> u32;
    /// Highest-priority active interrupt on `cpu`, `None` when spurious
    fn active_irq(&self, cpu: usize) -> Option<u32>;
    fn ack(&self, _irq: u32) {}
    fn mask(&self, irq: u32);
    fn unmask(&self, irq: u32);
    fn eoi(&self, irq: u32);
    fn set_type(&self, _irq: u32, _trigger: IrqTrigger) -> Result {
        Ok(())
    }
    fn set_affinity(&self, _irq: u32, _cpus: CpuMask) -> Result {
        Err(Error::Unsupp)
    }
    fn raise_ipi(&self, _irq: u32, _cpus: CpuMask) -> Result {
        Err(Error::Unsupp)
    }
}

/// Free-running monotonic counter
pub trait ClockSource: Send + Sync {
    fn name(&self) -> &str;
    /// Higher rating wins when several sources are registered
    fn rating(&self) -> u32;
    fn read(&self) -> u64;
    /// Valid bits of `read()`
    fn mask(&self) -> u64;
    /// cycles -> ns: `ns = (cycles * mult) >> shift`
    fn mult(&self) -> u32;
    fn shift(&self) -> u32;
}

/// Programmable one-shot timer of a host CPU
pub trait ClockChip: Send + Sync {
    fn name(&self) -> &str;
    /// Host IRQ raised on expiry
    fn hirq(&self) -> u32;
    /// ns -> cycles: `cycles = (ns * mult) >> shift`
    fn mult(&self) -> u32;
    fn shift(&self) -> u32;
    fn min_delta_ns(&self) -> u64;
    fn max_delta_ns(&self) -> u64;
    fn set_next_event(&self, cycles: u64) -> Result;
    fn shutdown(&self);
}
