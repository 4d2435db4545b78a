//! ARM64 Register Definitions
//!
//! The trap frame saved by the EL2 entry stub and reloaded on ERET, plus
//! the decoded exit reason the stub hands to the core.

use core::fmt;

use super::defs::*;
use crate::arch::traits::VcpuContextOps;

/// Number of general purpose registers (x0-x30)
pub const NUM_GPRS: usize = 31;

/// Register number that reads as zero and ignores writes (xzr/wzr)
pub const REG_ZERO: u8 = 31;

/// Trap frame of a VCPU.
///
/// For normal VCPUs this holds the EL1 context at the time of the trap; for
/// orphan threads it holds the EL2 context of the thread.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VcpuRegs {
    /// x0-x30; x29 is FP and x30 is LR
    pub gpr: [u64; NUM_GPRS],
    /// Stack pointer of the interrupted context
    pub sp: u64,
    /// Program counter - where to resume execution
    pub pc: u64,
    /// Saved PSTATE, restored on ERET
    pub pstate: u64,
}

impl Default for VcpuRegs {
    fn default() -> Self {
        Self {
            gpr: [0; NUM_GPRS],
            sp: 0,
            pc: 0,
            pstate: SPSR_EL1H_DAIF_MASKED,
        }
    }
}

impl VcpuRegs {
    /// Create a frame that starts executing at `entry` with stack `sp`
    pub fn new(entry: u64, sp: u64, pstate: u64) -> Self {
        Self {
            gpr: [0; NUM_GPRS],
            sp,
            pc: entry,
            pstate,
        }
    }

    /// Exception level encoded in the saved PSTATE
    pub fn exception_level(&self) -> u8 {
        ((self.pstate >> 2) & 0x3) as u8
    }
}

impl VcpuContextOps for VcpuRegs {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, val: u64) {
        self.pc = val;
    }

    fn sp(&self) -> u64 {
        self.sp
    }

    fn set_sp(&mut self, val: u64) {
        self.sp = val;
    }

    fn get_reg(&self, n: u8) -> u64 {
        match self.gpr.get(n as usize) {
            Some(v) => *v,
            None => 0,
        }
    }

    fn set_reg(&mut self, n: u8, val: u64) {
        if let Some(r) = self.gpr.get_mut(n as usize) {
            *r = val;
        }
    }

    fn advance_pc(&mut self, insn_len: u64) {
        self.pc = self.pc.wrapping_add(insn_len);
    }
}

impl fmt::Debug for VcpuRegs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "pc=0x{:016x} sp=0x{:016x} pstate=0x{:08x}",
            self.pc, self.sp, self.pstate
        )?;
        for (i, chunk) in self.gpr.chunks(4).enumerate() {
            for (j, v) in chunk.iter().enumerate() {
                write!(f, "x{:<2}=0x{:016x} ", i * 4 + j, v)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// VM Exit Reason
///
/// Represents why the guest trapped to the hypervisor, decoded from ESR_EL2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Unknown/undefined reason
    Unknown,
    /// WFI (Wait For Interrupt) or WFE (Wait For Event)
    WfiWfe,
    /// HVC (Hypervisor Call) instruction
    HvcCall,
    /// Trapped MSR/MRS (system register access)
    TrapMsrMrs,
    /// Instruction abort (instruction fetch fault)
    InstructionAbort,
    /// Data abort (data access fault)
    DataAbort,
    /// Other reason with exception class code
    Other(u64),
}

impl ExitReason {
    pub fn from_esr(esr: u64) -> Self {
        match (esr >> ESR_EC_SHIFT) & ESR_EC_MASK {
            EC_UNKNOWN => ExitReason::Unknown,
            EC_WFI_WFE => ExitReason::WfiWfe,
            EC_HVC64 => ExitReason::HvcCall,
            EC_MSR_MRS => ExitReason::TrapMsrMrs,
            EC_IABT_LOWER | EC_IABT_SAME => ExitReason::InstructionAbort,
            EC_DABT_LOWER | EC_DABT_SAME => ExitReason::DataAbort,
            ec => ExitReason::Other(ec),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Unknown => write!(f, "Unknown"),
            ExitReason::WfiWfe => write!(f, "WFI/WFE"),
            ExitReason::HvcCall => write!(f, "HVC Call"),
            ExitReason::TrapMsrMrs => write!(f, "MSR/MRS Trap"),
            ExitReason::InstructionAbort => write!(f, "Instruction Abort"),
            ExitReason::DataAbort => write!(f, "Data Abort"),
            ExitReason::Other(ec) => write!(f, "Other (EC=0x{:x})", ec),
        }
    }
}
