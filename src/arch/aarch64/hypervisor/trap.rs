//! Classification of guest exits into portable trap descriptions.

use super::super::defs::*;
use super::super::regs::ExitReason;
use super::decode::MmioAccess;
use crate::guest::{AccessKind, Stage2Fault};

/// What the EL2 entry stub should ask the core to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestTrap {
    Wfi,
    Stage2Fault(Stage2Fault),
    Hypercall(u16),
    Other(ExitReason),
}

/// Syndrome registers captured by the entry stub
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapSyndrome {
    pub esr: u64,
    pub far: u64,
    pub hpfar: u64,
    /// Faulting instruction word, fetched by the stub when ISV=0
    pub insn: Option<u32>,
}

impl TrapSyndrome {
    /// Faulting IPA: HPFAR_EL2.FIPA holds bits [47:12], FAR the page offset
    pub fn fault_ipa(&self) -> u64 {
        ((self.hpfar >> 4) << 12) | (self.far & PAGE_MASK_4KB)
    }

    pub fn classify(&self, big_endian: bool, from_el0: bool) -> GuestTrap {
        let iss = (self.esr & ESR_ISS_MASK) as u32;
        match ExitReason::from_esr(self.esr) {
            ExitReason::WfiWfe => GuestTrap::Wfi,
            ExitReason::HvcCall => GuestTrap::Hypercall((iss & 0xFFFF) as u16),
            ExitReason::DataAbort => {
                let mmio = MmioAccess::decode(self.insn.unwrap_or(0), iss);
                let access = match mmio {
                    Some(a) if a.is_store() => AccessKind::Write,
                    Some(_) => AccessKind::Read,
                    None if iss & ISS_WNR != 0 => AccessKind::Write,
                    None => AccessKind::Read,
                };
                GuestTrap::Stage2Fault(Stage2Fault {
                    gpa: self.fault_ipa(),
                    gva: self.far,
                    access,
                    size: mmio.map(|a| a.size()).unwrap_or(0),
                    is_unpriv: from_el0,
                    mmio: mmio.map(|a| a.to_info(big_endian)),
                })
            }
            ExitReason::InstructionAbort => GuestTrap::Stage2Fault(Stage2Fault {
                gpa: self.fault_ipa(),
                gva: self.far,
                access: AccessKind::Exec,
                size: AARCH64_INSN_SIZE as u8,
                is_unpriv: from_el0,
                mmio: None,
            }),
            other => GuestTrap::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_abort_word_load() {
        let iss = ISS_ISV | (2 << ISS_SAS_SHIFT) | (3 << ISS_SRT_SHIFT);
        let syn = TrapSyndrome {
            esr: (EC_DABT_LOWER << ESR_EC_SHIFT) | iss as u64,
            far: 0x1000_0004,
            hpfar: (0x1000_0000 >> 12) << 4,
            insn: None,
        };
        match syn.classify(false, false) {
            GuestTrap::Stage2Fault(f) => {
                assert_eq!(f.gpa, 0x1000_0004);
                assert_eq!(f.access, AccessKind::Read);
                assert_eq!(f.size, 4);
                let mmio = f.mmio.unwrap();
                assert_eq!(mmio.reg, 3);
                assert!(!mmio.write);
            }
            t => panic!("unexpected trap {:?}", t),
        }
    }

    #[test]
    fn wfi_and_hvc() {
        let wfi = TrapSyndrome { esr: EC_WFI_WFE << ESR_EC_SHIFT, ..Default::default() };
        assert_eq!(wfi.classify(false, false), GuestTrap::Wfi);
        let hvc = TrapSyndrome { esr: (EC_HVC64 << ESR_EC_SHIFT) | 0x42, ..Default::default() };
        assert_eq!(hvc.classify(false, false), GuestTrap::Hypercall(0x42));
    }
}
