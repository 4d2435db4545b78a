//! Guest exception and interrupt injection.
//!
//! Pure transformations of a trap frame plus private state; the backends
//! decide whether that state lives in hardware or in memory.

use super::super::defs::*;
use super::super::{VcpuArchState, VcpuRegs};
use crate::arch::traits::GuestException;
use crate::error::{Error, Result};

/// Deliver a synchronous exception to the guest's EL1 vector
pub fn inject_sync(regs: &mut VcpuRegs, st: &mut VcpuArchState, exc: &GuestException) {
    let from_lower = regs.pstate & PSR_MODE_MASK == PSR_MODE_EL0T;

    let (ec, iss, far) = match *exc {
        GuestException::DataAbort { fault_addr, write } => {
            let ec = if from_lower { EC_DABT_LOWER } else { EC_DABT_SAME };
            let wnr = if write { ISS_WNR as u64 } else { 0 };
            (ec, FSC_TRANSLATION_L0 | wnr, Some(fault_addr))
        }
        GuestException::InstructionAbort { fault_addr } => {
            let ec = if from_lower { EC_IABT_LOWER } else { EC_IABT_SAME };
            (ec, FSC_TRANSLATION_L0, Some(fault_addr))
        }
        GuestException::Undefined => (EC_UNKNOWN, 0, None),
    };

    st.esr_el1 = (ec << ESR_EC_SHIFT) | ESR_IL | (iss & ESR_ISS_MASK);
    if let Some(far) = far {
        st.far_el1 = far;
    }
    st.elr_el1 = regs.pc;
    st.spsr_el1 = regs.pstate;

    let offset = if from_lower {
        VECTOR_LOWER_A64_SYNC
    } else {
        VECTOR_CURRENT_SPX_SYNC
    };
    regs.pc = st.vbar_el1 + offset;
    regs.pstate = SPSR_EL1H_DAIF_MASKED;
}

/// Place `intid` into a free list register as pending
///
/// An interrupt already held by a list register is left alone.
pub fn queue_virq(st: &mut VcpuArchState, intid: u32, priority: u8) -> Result {
    if st.lr_for(intid).is_some() {
        return Ok(());
    }
    let slot = st.free_lr().ok_or(Error::Busy)?;
    st.ich_lr[slot] = (LR_STATE_PENDING << LR_STATE_SHIFT)
        | LR_GROUP1_BIT
        | ((priority as u64) << LR_PRIORITY_SHIFT)
        | (intid as u64 & LR_VINTID_MASK);
    Ok(())
}

/// Drop `intid` from the list registers if the guest has not taken it yet
pub fn withdraw_virq(st: &mut VcpuArchState, intid: u32) {
    if let Some(slot) = st.lr_for(intid) {
        if (st.ich_lr[slot] >> LR_STATE_SHIFT) & LR_STATE_MASK == LR_STATE_PENDING {
            st.ich_lr[slot] = 0;
        }
    }
}
