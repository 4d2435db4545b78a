//! ARM64 Stage-2 descriptor format
//!
//! Page Table Levels (for 4KB granule, 48-bit IPA):
//! - Level 0: 512GB regions (entry covers bits [47:39])
//! - Level 1: 1GB blocks (entry covers bits [38:30])
//! - Level 2: 2MB blocks (entry covers bits [29:21])
//! - Level 3: 4KB pages (entry covers bits [20:12])
//!
//! The walker in `mm::stage2` is format-agnostic above this module.

use crate::arch::aarch64::defs::*;
use crate::mm::stage2::MapFlags;

/// Number of translation levels
pub const LEVELS: usize = 4;

/// Level at which the walk starts
pub const ROOT_LEVEL: usize = 0;

/// Block/page sizes that may be installed as leaves, largest first,
/// with the level each one lives at.
pub const LEAF_SIZES: [(u64, usize); 3] = [(BLOCK_SIZE_1GB, 1), (BLOCK_SIZE_2MB, 2), (PAGE_SIZE_4KB, 3)];

/// Bit position of the index field for `level`
pub const fn level_shift(level: usize) -> u32 {
    39 - 9 * level as u32
}

/// Bytes covered by one entry at `level`
pub const fn level_size(level: usize) -> u64 {
    1u64 << level_shift(level)
}

/// Index of `addr` inside a table at `level`
pub const fn table_index(addr: u64, level: usize) -> usize {
    ((addr >> level_shift(level)) & PT_INDEX_MASK) as usize
}

/// Stage-2 page table entry
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct S2PageTableEntry(u64);

impl S2PageTableEntry {
    /// Create an invalid entry
    pub const fn invalid() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Leaf entry at `level`: a block at levels 1-2, a page at level 3
    pub fn leaf(addr: u64, attrs: MemoryAttributes, level: usize) -> Self {
        let kind = if level == LEVELS - 1 { PTE_TABLE } else { 0 };
        Self((addr & PTE_ADDR_MASK) | attrs.bits() | kind | PTE_VALID)
    }

    /// Create a table entry (points to next level)
    pub const fn table(next_level_addr: u64) -> Self {
        Self((next_level_addr & PTE_ADDR_MASK) | PTE_VALID | PTE_TABLE)
    }

    pub fn is_valid(&self) -> bool {
        (self.0 & PTE_VALID) != 0
    }

    /// Table descriptor; level 3 uses the same encoding for pages
    pub fn is_table(&self, level: usize) -> bool {
        level < LEVELS - 1 && (self.0 & (PTE_VALID | PTE_TABLE)) == (PTE_VALID | PTE_TABLE)
    }

    pub fn is_leaf(&self, level: usize) -> bool {
        self.is_valid() && !self.is_table(level)
    }

    /// Get physical address from entry
    pub fn addr(&self) -> u64 {
        self.0 & PTE_ADDR_MASK
    }

    pub fn attrs(&self) -> MemoryAttributes {
        MemoryAttributes {
            bits: self.0 & PTE_ATTR_MASK,
        }
    }

    /// Get raw value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Memory attributes for Stage-2 translation
///
/// Descriptor bits:
/// - [5:2]  MemAttr[3:0]
/// - [7:6]  S2AP[1:0] (bit 6 = read, bit 7 = write)
/// - [9:8]  SH[1:0]
/// - [10]   AF (Access Flag, must be 1)
/// - [54]   XN
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryAttributes {
    bits: u64,
}

impl MemoryAttributes {
    pub fn from_flags(flags: MapFlags) -> Self {
        let memattr = if flags.contains(MapFlags::DEVICE) {
            PTE_MEMATTR_DEVICE
        } else if flags.contains(MapFlags::CACHEABLE) {
            PTE_MEMATTR_NORMAL_WB
        } else {
            PTE_MEMATTR_NORMAL_NC
        };
        let mut bits = (memattr << PTE_MEMATTR_SHIFT) | PTE_AF;
        if !flags.contains(MapFlags::DEVICE) {
            bits |= PTE_SH_INNER;
        }
        if flags.contains(MapFlags::READ) {
            bits |= PTE_S2AP_READ;
        }
        if flags.contains(MapFlags::WRITE) {
            bits |= PTE_S2AP_WRITE;
        }
        if !flags.contains(MapFlags::EXEC) {
            bits |= PTE_XN;
        }
        Self { bits }
    }

    pub fn to_flags(self) -> MapFlags {
        let mut flags = MapFlags::empty();
        match (self.bits >> PTE_MEMATTR_SHIFT) & 0xF {
            PTE_MEMATTR_DEVICE => flags |= MapFlags::DEVICE,
            PTE_MEMATTR_NORMAL_WB => flags |= MapFlags::CACHEABLE,
            _ => {}
        }
        if self.bits & PTE_S2AP_READ != 0 {
            flags |= MapFlags::READ;
        }
        if self.bits & PTE_S2AP_WRITE != 0 {
            flags |= MapFlags::WRITE;
        }
        if self.bits & PTE_XN == 0 {
            flags |= MapFlags::EXEC;
        }
        flags
    }

    /// Get raw bits
    pub const fn bits(&self) -> u64 {
        self.bits
    }
}

/// Stage-2 Translation configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage2Config {
    /// Virtual Translation Table Base Register (VTTBR_EL2)
    pub vttbr: u64,
    /// Virtual Translation Control Register (VTCR_EL2)
    pub vtcr: u64,
}

impl Stage2Config {
    /// VTTBR_EL2 format: VMID in bits [63:48], page table base in bits [47:1]
    pub fn new_with_vmid(page_table_addr: u64, vmid: u16) -> Self {
        let vttbr = (page_table_addr & VTTBR_BADDR_MASK) | ((vmid as u64) << VTTBR_VMID_SHIFT);
        Self {
            vttbr,
            vtcr: VTCR_DEFAULT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_survive_encoding() {
        for flags in [
            MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC | MapFlags::CACHEABLE,
            MapFlags::READ | MapFlags::CACHEABLE,
            MapFlags::READ | MapFlags::WRITE | MapFlags::DEVICE,
        ] {
            assert_eq!(MemoryAttributes::from_flags(flags).to_flags(), flags);
        }
    }

    #[test]
    fn leaf_kinds_per_level() {
        let attrs = MemoryAttributes::from_flags(MapFlags::READ);
        let block = S2PageTableEntry::leaf(0x4020_0000, attrs, 2);
        assert!(block.is_leaf(2));
        assert!(!block.is_table(2));
        let page = S2PageTableEntry::leaf(0x4000_1000, attrs, 3);
        assert!(page.is_leaf(3));
        assert_eq!(page.addr(), 0x4000_1000);
        assert!(S2PageTableEntry::table(0x8000_0000).is_table(1));
    }

    #[test]
    fn vttbr_carries_vmid() {
        let cfg = Stage2Config::new_with_vmid(0x4123_4000, 7);
        assert_eq!(cfg.vttbr, 0x0007_0000_4123_4000);
    }

    #[test]
    fn level_geometry() {
        assert_eq!(level_size(1), BLOCK_SIZE_1GB);
        assert_eq!(level_size(2), BLOCK_SIZE_2MB);
        assert_eq!(level_size(3), PAGE_SIZE_4KB);
        assert_eq!(table_index(0xDEAD_BEE0, 3), 0xDB);
    }
}
