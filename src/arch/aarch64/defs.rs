//! ARM64 Architecture Constants
//!
//! Named constants for system register fields, exception classes,
//! GIC list register encoding, stage-2 descriptor bits and firmware
//! function ids used by the AArch64 backend.

// ── HCR_EL2 (Hypervisor Configuration Register) ─────────────────────
pub const HCR_VM: u64 = 1 << 0;
pub const HCR_SWIO: u64 = 1 << 1;
pub const HCR_FMO: u64 = 1 << 3;
pub const HCR_IMO: u64 = 1 << 4;
pub const HCR_AMO: u64 = 1 << 5;
pub const HCR_VI: u64 = 1 << 7;
pub const HCR_BSU_INNER: u64 = 1 << 10;
pub const HCR_TWI: u64 = 1 << 13;
pub const HCR_TWE: u64 = 1 << 14;
pub const HCR_RW: u64 = 1 << 31;
pub const HCR_APK: u64 = 1 << 40;
pub const HCR_API: u64 = 1 << 41;

/// HCR_EL2 value while a normal VCPU is loaded.
pub const HCR_GUEST_FLAGS: u64 = HCR_VM
    | HCR_SWIO
    | HCR_FMO
    | HCR_IMO
    | HCR_AMO
    | HCR_BSU_INNER
    | HCR_TWI
    | HCR_TWE
    | HCR_RW
    | HCR_APK
    | HCR_API;

// ── ESR (Exception Syndrome Register) ────────────────────────────────
pub const ESR_EC_SHIFT: u32 = 26;
pub const ESR_EC_MASK: u64 = 0x3F;
pub const ESR_IL: u64 = 1 << 25;
pub const ESR_ISS_MASK: u64 = 0x1FF_FFFF;

// Data abort ISS fields
pub const ISS_ISV: u32 = 1 << 24;
pub const ISS_SAS_SHIFT: u32 = 22;
pub const ISS_SSE: u32 = 1 << 21;
pub const ISS_SRT_SHIFT: u32 = 16;
pub const ISS_SF: u32 = 1 << 15;
pub const ISS_WNR: u32 = 1 << 6;
pub const ISS_S1PTW: u32 = 1 << 7;

/// Translation fault, level 0 (FSC encoding used for injected aborts)
pub const FSC_TRANSLATION_L0: u64 = 0x04;
pub const FSC_PERMISSION_L3: u64 = 0x0F;

// ── Exception Class (EC) values ──────────────────────────────────────
pub const EC_UNKNOWN: u64 = 0x00;
pub const EC_WFI_WFE: u64 = 0x01;
pub const EC_HVC64: u64 = 0x16;
pub const EC_MSR_MRS: u64 = 0x18;
pub const EC_IABT_LOWER: u64 = 0x20;
pub const EC_IABT_SAME: u64 = 0x21;
pub const EC_DABT_LOWER: u64 = 0x24;
pub const EC_DABT_SAME: u64 = 0x25;

// ── PSTATE / SPSR ────────────────────────────────────────────────────
pub const PSR_MODE_MASK: u64 = 0xF;
pub const PSR_MODE_EL0T: u64 = 0b0000;
pub const PSR_MODE_EL1H: u64 = 0b0101;
pub const PSR_MODE_EL2H: u64 = 0b1001;
pub const PSR_F: u64 = 1 << 6;
pub const PSR_I: u64 = 1 << 7;
pub const PSR_A: u64 = 1 << 8;
pub const PSR_D: u64 = 1 << 9;
pub const SPSR_EL1H_DAIF_MASKED: u64 = PSR_D | PSR_A | PSR_I | PSR_F | PSR_MODE_EL1H;
/// Orphan threads run at EL2 with IRQs unmasked so the tick can preempt them.
pub const SPSR_EL2H_IRQ_ON: u64 = PSR_D | PSR_A | PSR_MODE_EL2H;

// ── Exception vector offsets (relative to VBAR_EL1) ──────────────────
pub const VECTOR_CURRENT_SPX_SYNC: u64 = 0x200;
pub const VECTOR_LOWER_A64_SYNC: u64 = 0x400;

// ── SCTLR_EL1 ────────────────────────────────────────────────────────
pub const SCTLR_EE: u64 = 1 << 25;
pub const SCTLR_E0E: u64 = 1 << 24;
pub const SCTLR_EL1_RES1: u64 = (1 << 29) | (1 << 28) | (1 << 23) | (1 << 22) | (1 << 20) | (1 << 11);

// ── ICH_HCR_EL2 (Hypervisor Control Register for Virtual GIC) ───────
pub const ICH_HCR_EN: u64 = 1 << 0;
pub const ICH_HCR_TALL1: u64 = 1 << 13;
/// ICH_VMCR_EL2: VPMR=0xFF, VENG1=1
pub const ICH_VMCR_DEFAULT: u64 = (0xFF << 24) | (1 << 1);

// ── GICv3 List Register field positions ──────────────────────────────
pub const NUM_LRS: usize = 4;
pub const LR_STATE_SHIFT: u32 = 62;
pub const LR_STATE_MASK: u64 = 0x3;
pub const LR_STATE_PENDING: u64 = 0b01;
pub const LR_GROUP1_BIT: u64 = 1 << 60;
pub const LR_PRIORITY_SHIFT: u32 = 48;
pub const LR_VINTID_MASK: u64 = 0xFFFF_FFFF;
pub const GIC_SPURIOUS_INTID: u32 = 1023;

// ── Interrupt priority ───────────────────────────────────────────────
pub const IRQ_DEFAULT_PRIORITY: u8 = 0xA0;

// ── VTCR_EL2 fields ─────────────────────────────────────────────────
pub const VTCR_T0SZ_48BIT: u64 = 16;
pub const VTCR_SL0_LEVEL0: u64 = 2 << 6;
pub const VTCR_IRGN0_WB: u64 = 0b01 << 8;
pub const VTCR_ORGN0_WB: u64 = 0b01 << 10;
pub const VTCR_SH0_INNER: u64 = 0b11 << 12;
pub const VTCR_TG0_4KB: u64 = 0b00 << 14;
pub const VTCR_PS_48BIT: u64 = 0b101 << 16;
pub const VTCR_DEFAULT: u64 = VTCR_T0SZ_48BIT
    | VTCR_SL0_LEVEL0
    | VTCR_IRGN0_WB
    | VTCR_ORGN0_WB
    | VTCR_SH0_INNER
    | VTCR_TG0_4KB
    | VTCR_PS_48BIT;
pub const VTTBR_BADDR_MASK: u64 = 0x0000_FFFF_FFFF_FFFE;
pub const VTTBR_VMID_SHIFT: u32 = 48;

// ── CNTHCTL_EL2 bits ─────────────────────────────────────────────────
pub const CNTHCTL_EL1PCTEN: u64 = 1 << 0;
pub const CNTHCTL_EL1PCEN: u64 = 1 << 1;
pub const CNT_CTL_ENABLE: u64 = 1 << 0;
pub const CNT_CTL_IMASK: u64 = 1 << 1;
pub const CNT_CTL_ISTATUS: u64 = 1 << 2;
/// EL2 physical timer PPI
pub const CNTHP_INTID: u32 = 26;

// ── Stage-2 descriptor bits ──────────────────────────────────────────
pub const PTE_VALID: u64 = 1 << 0;
pub const PTE_TABLE: u64 = 1 << 1;
pub const PTE_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;
pub const PTE_MEMATTR_SHIFT: u32 = 2;
pub const PTE_MEMATTR_NORMAL_WB: u64 = 0b1111;
pub const PTE_MEMATTR_NORMAL_NC: u64 = 0b0101;
pub const PTE_MEMATTR_DEVICE: u64 = 0b0000;
pub const PTE_S2AP_READ: u64 = 1 << 6;
pub const PTE_S2AP_WRITE: u64 = 1 << 7;
pub const PTE_SH_INNER: u64 = 0b11 << 8;
pub const PTE_AF: u64 = 1 << 10;
pub const PTE_XN: u64 = 1 << 54;
pub const PTE_ATTR_MASK: u64 = !PTE_ADDR_MASK & !(PTE_VALID | PTE_TABLE);
pub const PT_INDEX_MASK: u64 = 0x1FF;
pub const PT_ENTRIES: usize = 512;

pub const PAGE_SIZE_4KB: u64 = 4096;
pub const PAGE_MASK_4KB: u64 = PAGE_SIZE_4KB - 1;
pub const BLOCK_SIZE_2MB: u64 = 2 * 1024 * 1024;
pub const BLOCK_MASK_2MB: u64 = BLOCK_SIZE_2MB - 1;
pub const BLOCK_SIZE_1GB: u64 = 1024 * 1024 * 1024;

// ── PSCI function ids (SMC64 calling convention) ────────────────────
pub const PSCI_SYSTEM_OFF: u64 = 0x8400_0008;
pub const PSCI_SYSTEM_RESET: u64 = 0x8400_0009;

// ── ARM64 instruction width ──────────────────────────────────────────
pub const AARCH64_INSN_SIZE: u64 = 4;
