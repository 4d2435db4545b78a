//! Stage-2 descriptor format for the 4 KiB granule, 48-bit IPA

pub mod mmu;
