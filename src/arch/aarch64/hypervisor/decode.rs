/// ARM64 instruction decoder for MMIO emulation
///
/// Decodes the load/store that caused a stage-2 data abort, from the ESR
/// syndrome when the hardware provides it and from the instruction word
/// otherwise.
use super::super::defs::*;
use crate::devices::MmioInfo;

/// Decoded load/store instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioAccess {
    /// Load instruction: LDR, LDRB, LDRH, LDRS*, LDUR
    Load {
        reg: u8,  // Destination register (0-31, 31 = xzr)
        size: u8, // Access size in bytes (1, 2, 4, 8)
        sign_extend: bool,
        /// Destination is an X register
        sf: bool,
    },
    /// Store instruction: STR, STRB, STRH, STUR
    Store {
        reg: u8,  // Source register (0-31, 31 = xzr)
        size: u8, // Access size in bytes (1, 2, 4, 8)
    },
}

impl MmioAccess {
    /// Decode an instruction that caused a data abort
    ///
    /// # Arguments
    /// * `insn` - The 32-bit instruction encoding (only used when ISV=0)
    /// * `iss` - Instruction Specific Syndrome from ESR_EL2
    pub fn decode(insn: u32, iss: u32) -> Option<Self> {
        if iss & ISS_ISV == 0 {
            return Self::decode_instruction(insn);
        }

        let size = 1u8 << ((iss >> ISS_SAS_SHIFT) & 0x3);
        let reg = ((iss >> ISS_SRT_SHIFT) & 0x1F) as u8;

        if iss & ISS_WNR != 0 {
            Some(MmioAccess::Store { reg, size })
        } else {
            Some(MmioAccess::Load {
                reg,
                size,
                sign_extend: iss & ISS_SSE != 0,
                sf: iss & ISS_SF != 0,
            })
        }
    }

    /// Decode the instruction word when ISV is not valid
    ///
    /// Only general-purpose register forms without base writeback are
    /// accepted: the unsigned-offset and unscaled-offset encodings.
    fn decode_instruction(insn: u32) -> Option<Self> {
        let unsigned_offset = insn & 0x3F00_0000 == 0x3900_0000;
        let unscaled_offset = insn & 0x3F20_0C00 == 0x3800_0000;
        if !unsigned_offset && !unscaled_offset {
            return None;
        }

        let size_bits = (insn >> 30) & 0x3;
        let size = 1u8 << size_bits;
        let reg = (insn & 0x1F) as u8;

        match (insn >> 22) & 0x3 {
            0b00 => Some(MmioAccess::Store { reg, size }),
            0b01 => Some(MmioAccess::Load {
                reg,
                size,
                sign_extend: false,
                sf: size == 8,
            }),
            // LDRS* into an X register; size 8 here is PRFM
            0b10 if size < 8 => Some(MmioAccess::Load {
                reg,
                size,
                sign_extend: true,
                sf: true,
            }),
            // LDRS* into a W register; LDRSW has no W form
            0b11 if size < 4 => Some(MmioAccess::Load {
                reg,
                size,
                sign_extend: true,
                sf: false,
            }),
            _ => None,
        }
    }

    /// Get the register number
    pub fn reg(&self) -> u8 {
        match self {
            MmioAccess::Load { reg, .. } => *reg,
            MmioAccess::Store { reg, .. } => *reg,
        }
    }

    /// Get the access size in bytes
    pub fn size(&self) -> u8 {
        match self {
            MmioAccess::Load { size, .. } => *size,
            MmioAccess::Store { size, .. } => *size,
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, MmioAccess::Store { .. })
    }

    /// Portable description for the emulation dispatcher
    pub fn to_info(self, big_endian: bool) -> MmioInfo {
        match self {
            MmioAccess::Load {
                reg,
                size,
                sign_extend,
                sf,
            } => MmioInfo {
                write: false,
                size,
                reg,
                sign_extend,
                reg_64bit: sf,
                big_endian,
                insn_len: AARCH64_INSN_SIZE,
            },
            MmioAccess::Store { reg, size } => MmioInfo {
                write: true,
                size,
                reg,
                sign_extend: false,
                reg_64bit: true,
                big_endian,
                insn_len: AARCH64_INSN_SIZE,
            },
        }
    }
}
