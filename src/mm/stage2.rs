//! Second-stage (IPA -> PA) translation tables.
//!
//! One `Stage2Table` per guest. Structural changes happen under the guest's
//! table mutex; individual descriptors are still written atomically because
//! other CPUs walk the same tree in hardware. Live leaf changes follow
//! break-before-make, and every unmap or permission change is followed by
//! a broadcast TLB invalidation.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::{debug, trace};

use super::host::HostAspace;
use crate::arch::aarch64::defs::{PAGE_SIZE_4KB, PT_ENTRIES};
use crate::arch::aarch64::mm::mmu::{
    level_size, table_index, MemoryAttributes, S2PageTableEntry, Stage2Config, LEAF_SIZES, LEVELS,
    ROOT_LEVEL,
};
use crate::arch::intrinsics;
use crate::arch::traits::{Stage2Root, TlbScope, VcpuArch};
use crate::error::{Error, Result};

bitflags! {
    /// Access rights and memory type of a stage-2 mapping
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const CACHEABLE = 1 << 3;
        const DEVICE = 1 << 4;
    }
}

/// Largest leaf size usable at `gpa`/`hpa` with `remaining` bytes left
pub fn best_page_size(gpa: u64, hpa: u64, remaining: u64) -> u64 {
    LEAF_SIZES
        .iter()
        .map(|&(size, _)| size)
        .find(|&size| gpa % size == 0 && hpa % size == 0 && remaining >= size)
        .unwrap_or(PAGE_SIZE_4KB)
}

fn leaf_level(size: u64) -> Option<usize> {
    LEAF_SIZES
        .iter()
        .find(|&&(s, _)| s == size)
        .map(|&(_, level)| level)
}

fn entry(host: &HostAspace, table_pa: u64, index: usize) -> &AtomicU64 {
    debug_assert!(index < PT_ENTRIES);
    // SAFETY: `table_pa` is a table page owned by this tree, allocated from
    // the host pool and linearly mapped. Descriptors are 8-byte aligned.
    unsafe { &*(host.pa2va(table_pa) as *const AtomicU64).add(index) }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RangeOp {
    Unmap,
    Protect(MapFlags),
}

/// A guest's stage-2 translation tree
pub struct Stage2Table {
    root_pa: u64,
    vmid: u16,
    /// Every table page of the tree, root included
    tables: Vec<u64>,
}

impl Stage2Table {
    pub fn create(host: &HostAspace, vmid: u16) -> Result<Self> {
        let root_pa = host.alloc_zeroed_frame()?;
        debug!("stage2: vmid {} root {:#x}", vmid, root_pa);
        Ok(Self {
            root_pa,
            vmid,
            tables: alloc::vec![root_pa],
        })
    }

    /// Release every table page and drop the VMID's TLB entries
    pub fn destroy(self, host: &HostAspace, arch: &dyn VcpuArch) {
        arch.tlb_invalidate(intrinsics::current_cpu_id(), TlbScope::Vmid(self.vmid));
        for pa in self.tables {
            host.free_frame(pa);
        }
    }

    pub fn root(&self) -> Stage2Root {
        Stage2Root {
            root_pa: self.root_pa,
            vmid: self.vmid,
        }
    }

    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    /// VTTBR/VTCR values for this tree
    pub fn hw_config(&self) -> Stage2Config {
        Stage2Config::new_with_vmid(self.root_pa, self.vmid)
    }

    pub fn table_pages(&self) -> usize {
        self.tables.len()
    }

    /// Install one leaf of `size` bytes
    ///
    /// Re-installing an identical translation succeeds; any other
    /// existing translation in the way is an `Overlap`.
    pub fn map_page(
        &mut self,
        host: &HostAspace,
        gpa: u64,
        hpa: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result {
        let target = leaf_level(size).ok_or(Error::Invalid)?;
        if gpa % size != 0 || hpa % size != 0 {
            return Err(Error::Invalid);
        }
        let attrs = MemoryAttributes::from_flags(flags);
        let mut table = self.root_pa;

        for level in ROOT_LEVEL..target {
            let e = entry(host, table, table_index(gpa, level));
            let pte = S2PageTableEntry::from_raw(e.load(Ordering::Acquire));
            if pte.is_table(level) {
                table = pte.addr();
                continue;
            }
            if pte.is_valid() {
                // A larger block already covers gpa.
                let offset = gpa & (level_size(level) - 1);
                return if pte.addr() + offset == hpa && pte.attrs() == attrs {
                    Ok(())
                } else {
                    Err(Error::Overlap)
                };
            }
            let next = host.alloc_zeroed_frame()?;
            let new = S2PageTableEntry::table(next).raw();
            let prev = intrinsics::cmpxchg(e, 0, new);
            if prev == 0 {
                self.tables.push(next);
                table = next;
            } else {
                host.free_frame(next);
                let raced = S2PageTableEntry::from_raw(prev);
                if !raced.is_table(level) {
                    return Err(Error::Overlap);
                }
                table = raced.addr();
            }
        }

        let e = entry(host, table, table_index(gpa, target));
        let leaf = S2PageTableEntry::leaf(hpa, attrs, target);
        match intrinsics::cmpxchg(e, 0, leaf.raw()) {
            0 => {
                trace!("stage2: vmid {} {:#x} -> {:#x} ({:#x})", self.vmid, gpa, hpa, size);
                Ok(())
            }
            prev if prev == leaf.raw() => Ok(()),
            _ => Err(Error::Overlap),
        }
    }

    /// Map `[gpa, gpa + size)` using the largest leaves alignment allows
    pub fn map_range(
        &mut self,
        host: &HostAspace,
        gpa: u64,
        hpa: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result {
        if (gpa | hpa | size) & (PAGE_SIZE_4KB - 1) != 0 {
            return Err(Error::Invalid);
        }
        let mut off = 0;
        while off < size {
            let step = best_page_size(gpa + off, hpa + off, size - off);
            self.map_page(host, gpa + off, hpa + off, step, flags)?;
            off += step;
        }
        Ok(())
    }

    /// Remove the translation of `[gpa, gpa + size)`
    ///
    /// Blocks straddling the range boundary are split first. Unmapped
    /// holes inside the range are fine.
    pub fn unmap_page(
        &mut self,
        host: &HostAspace,
        arch: &dyn VcpuArch,
        gpa: u64,
        size: u64,
    ) -> Result {
        if (gpa | size) & (PAGE_SIZE_4KB - 1) != 0 || size == 0 {
            return Err(Error::Invalid);
        }
        self.walk_level(host, arch, self.root_pa, ROOT_LEVEL, gpa, gpa + size, RangeOp::Unmap)
    }

    /// Change access rights of every mapped page in `[gpa, gpa + size)`
    pub fn protect(
        &mut self,
        host: &HostAspace,
        arch: &dyn VcpuArch,
        gpa: u64,
        size: u64,
        flags: MapFlags,
    ) -> Result {
        if (gpa | size) & (PAGE_SIZE_4KB - 1) != 0 || size == 0 {
            return Err(Error::Invalid);
        }
        self.walk_level(
            host,
            arch,
            self.root_pa,
            ROOT_LEVEL,
            gpa,
            gpa + size,
            RangeOp::Protect(flags),
        )
    }

    /// Rewrite the access rights of the leaf that already translates `gpa`
    /// to `hpa`, at whatever size that leaf has
    pub fn reprotect_leaf(
        &mut self,
        host: &HostAspace,
        arch: &dyn VcpuArch,
        gpa: u64,
        hpa: u64,
        flags: MapFlags,
    ) -> Result {
        let (pa, _, size) = self.translate(host, gpa).ok_or(Error::NotAvail)?;
        if pa != hpa {
            return Err(Error::Overlap);
        }
        self.protect(host, arch, gpa & !(size - 1), size, flags)
    }

    /// Walk the tree for `gpa`: host address, flags and leaf size
    pub fn translate(&self, host: &HostAspace, gpa: u64) -> Option<(u64, MapFlags, u64)> {
        let mut table = self.root_pa;
        for level in ROOT_LEVEL..LEVELS {
            let pte = S2PageTableEntry::from_raw(
                entry(host, table, table_index(gpa, level)).load(Ordering::Acquire),
            );
            if !pte.is_valid() {
                return None;
            }
            if pte.is_table(level) {
                table = pte.addr();
                continue;
            }
            let size = level_size(level);
            return Some((pte.addr() + (gpa & (size - 1)), pte.attrs().to_flags(), size));
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_level(
        &mut self,
        host: &HostAspace,
        arch: &dyn VcpuArch,
        table: u64,
        level: usize,
        start: u64,
        end: u64,
        op: RangeOp,
    ) -> Result {
        let size = level_size(level);
        let mut addr = start;
        while addr < end {
            let blk_start = addr & !(size - 1);
            let blk_end = blk_start + size;
            let next = blk_end.min(end);
            let covers = addr == blk_start && next == blk_end;

            let e = entry(host, table, table_index(addr, level));
            let pte = S2PageTableEntry::from_raw(e.load(Ordering::Acquire));

            if !pte.is_valid() {
                // nothing mapped here
            } else if pte.is_table(level) {
                if covers && op == RangeOp::Unmap {
                    e.store(0, Ordering::Release);
                    self.invalidate(arch, TlbScope::Vmid(self.vmid));
                    self.free_subtree(host, pte.addr(), level + 1);
                } else {
                    self.walk_level(host, arch, pte.addr(), level + 1, addr, next, op)?;
                }
            } else if covers {
                e.store(0, Ordering::Release);
                self.invalidate(
                    arch,
                    TlbScope::Ipa {
                        vmid: self.vmid,
                        ipa: blk_start,
                    },
                );
                if let RangeOp::Protect(flags) = op {
                    let attrs = MemoryAttributes::from_flags(flags);
                    let leaf = S2PageTableEntry::leaf(pte.addr(), attrs, level);
                    e.store(leaf.raw(), Ordering::Release);
                }
            } else {
                let sub = self.split_block(host, arch, e, pte, level, blk_start)?;
                self.walk_level(host, arch, sub, level + 1, addr, next, op)?;
            }
            addr = next;
        }
        Ok(())
    }

    /// Replace a block with a table of equivalent smaller leaves
    fn split_block(
        &mut self,
        host: &HostAspace,
        arch: &dyn VcpuArch,
        e: &AtomicU64,
        block: S2PageTableEntry,
        level: usize,
        blk_start: u64,
    ) -> Result<u64> {
        let sub = host.alloc_zeroed_frame()?;
        let step = level_size(level + 1);
        for i in 0..PT_ENTRIES {
            let leaf = S2PageTableEntry::leaf(block.addr() + i as u64 * step, block.attrs(), level + 1);
            entry(host, sub, i).store(leaf.raw(), Ordering::Relaxed);
        }
        intrinsics::smp_wmb();

        e.store(0, Ordering::Release);
        self.invalidate(
            arch,
            TlbScope::Ipa {
                vmid: self.vmid,
                ipa: blk_start,
            },
        );
        e.store(S2PageTableEntry::table(sub).raw(), Ordering::Release);
        self.tables.push(sub);
        trace!("stage2: vmid {} split {:#x} at level {}", self.vmid, blk_start, level);
        Ok(sub)
    }

    fn free_subtree(&mut self, host: &HostAspace, table: u64, level: usize) {
        if level < LEVELS - 1 {
            for i in 0..PT_ENTRIES {
                let pte = S2PageTableEntry::from_raw(entry(host, table, i).load(Ordering::Acquire));
                if pte.is_table(level) {
                    self.free_subtree(host, pte.addr(), level + 1);
                }
            }
        }
        if let Some(pos) = self.tables.iter().position(|&pa| pa == table) {
            self.tables.swap_remove(pos);
        }
        host.free_frame(table);
    }

    fn invalidate(&self, arch: &dyn VcpuArch, scope: TlbScope) {
        arch.tlb_invalidate(intrinsics::current_cpu_id(), scope);
    }
}

/// Allocator for 8-bit VMIDs; VMID 0 stays with the host
pub struct VmidPool {
    used: [u64; 4],
}

impl VmidPool {
    pub const fn new() -> Self {
        Self { used: [1, 0, 0, 0] }
    }

    pub fn alloc(&mut self) -> Result<u16> {
        for (w, word) in self.used.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros();
                *word |= 1 << bit;
                return Ok((w as u32 * 64 + bit) as u16);
            }
        }
        Err(Error::Busy)
    }

    pub fn free(&mut self, vmid: u16) {
        if vmid != 0 && vmid < 256 {
            self.used[vmid as usize / 64] &= !(1 << (vmid % 64));
        }
    }
}

impl Default for VmidPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::aarch64::defs::{BLOCK_SIZE_1GB, BLOCK_SIZE_2MB};
    use crate::arch::aarch64::hosted::HostedAarch64;
    use crate::mm::host::HostRamPool;

    fn host() -> HostAspace {
        let buf = alloc::vec![0u8; 0x40_0000 + 0x20_0000].leak();
        let base = (buf.as_ptr() as u64 + 0x1F_FFFF) & !0x1F_FFFF;
        HostAspace::new(HostRamPool {
            phys_base: base,
            size: 0x40_0000,
            virt_base: base as usize,
        })
    }

    const RW: MapFlags = MapFlags::READ.union(MapFlags::WRITE).union(MapFlags::CACHEABLE);

    #[test]
    fn page_size_policy() {
        assert_eq!(best_page_size(0x4000_0000, 0x8000_0000, BLOCK_SIZE_1GB), BLOCK_SIZE_1GB);
        assert_eq!(best_page_size(0x4000_0000, 0x8020_0000, BLOCK_SIZE_1GB), BLOCK_SIZE_2MB);
        assert_eq!(best_page_size(0x4000_1000, 0x8000_1000, BLOCK_SIZE_1GB), PAGE_SIZE_4KB);
        assert_eq!(best_page_size(0x4000_0000, 0x8000_0000, 0x1000), PAGE_SIZE_4KB);
    }

    #[test]
    fn map_translate_unmap() {
        let host = host();
        let arch = HostedAarch64::new(1);
        let mut s2 = Stage2Table::create(&host, 1).unwrap();

        s2.map_page(&host, 0x4000_0000, 0x8000_0000, BLOCK_SIZE_2MB, RW).unwrap();
        let (hpa, flags, size) = s2.translate(&host, 0x4001_2345).unwrap();
        assert_eq!(hpa, 0x8001_2345);
        assert_eq!(flags, RW);
        assert_eq!(size, BLOCK_SIZE_2MB);

        // Same translation again is fine, a different one is not.
        s2.map_page(&host, 0x4000_0000, 0x8000_0000, BLOCK_SIZE_2MB, RW).unwrap();
        assert_eq!(
            s2.map_page(&host, 0x4000_1000, 0x9000_0000, PAGE_SIZE_4KB, RW),
            Err(Error::Overlap)
        );

        s2.unmap_page(&host, &arch, 0x4000_0000, BLOCK_SIZE_2MB).unwrap();
        assert!(s2.translate(&host, 0x4001_2345).is_none());
        assert!(arch.tlb_flushes() > 0);
        s2.destroy(&host, &arch);
    }

    #[test]
    fn partial_unmap_splits_block() {
        let host = host();
        let arch = HostedAarch64::new(1);
        let mut s2 = Stage2Table::create(&host, 2).unwrap();
        s2.map_page(&host, 0x4000_0000, 0x8000_0000, BLOCK_SIZE_2MB, RW).unwrap();
        let before = s2.table_pages();

        s2.unmap_page(&host, &arch, 0x4000_3000, PAGE_SIZE_4KB).unwrap();
        assert_eq!(s2.table_pages(), before + 1);
        assert!(s2.translate(&host, 0x4000_3000).is_none());
        let (hpa, _, size) = s2.translate(&host, 0x4000_4000).unwrap();
        assert_eq!((hpa, size), (0x8000_4000, PAGE_SIZE_4KB));
    }

    #[test]
    fn protect_drops_write() {
        let host = host();
        let arch = HostedAarch64::new(1);
        let mut s2 = Stage2Table::create(&host, 3).unwrap();
        s2.map_range(&host, 0x4000_0000, 0x8000_0000, 0x4000, RW).unwrap();
        s2.protect(&host, &arch, 0x4000_1000, 0x1000, MapFlags::READ | MapFlags::CACHEABLE)
            .unwrap();
        assert_eq!(s2.translate(&host, 0x4000_1000).unwrap().1, MapFlags::READ | MapFlags::CACHEABLE);
        assert_eq!(s2.translate(&host, 0x4000_2000).unwrap().1, RW);
    }

    #[test]
    fn reprotect_keeps_split_granularity() {
        let host = host();
        let arch = HostedAarch64::new(1);
        let mut s2 = Stage2Table::create(&host, 5).unwrap();
        s2.map_page(&host, 0x4000_0000, 0x8000_0000, BLOCK_SIZE_2MB, RW).unwrap();
        s2.protect(&host, &arch, 0x4000_1000, 0x1000, MapFlags::READ | MapFlags::CACHEABLE)
            .unwrap();

        // The block is now a table; reinstalling it collides.
        assert_eq!(
            s2.map_page(&host, 0x4000_0000, 0x8000_0000, BLOCK_SIZE_2MB, RW),
            Err(Error::Overlap)
        );
        let flushes = arch.tlb_flushes();
        s2.reprotect_leaf(&host, &arch, 0x4000_1234, 0x8000_1234, RW).unwrap();
        assert_eq!(s2.translate(&host, 0x4000_1000), Some((0x8000_1000, RW, PAGE_SIZE_4KB)));
        assert!(arch.tlb_flushes() > flushes);

        assert_eq!(
            s2.reprotect_leaf(&host, &arch, 0x4000_2000, 0x9000_2000, RW),
            Err(Error::Overlap)
        );
        assert_eq!(
            s2.reprotect_leaf(&host, &arch, 0x4100_0000, 0x8100_0000, RW),
            Err(Error::NotAvail)
        );
    }

    #[test]
    fn destroy_returns_table_pages() {
        let host = host();
        let arch = HostedAarch64::new(1);
        let free = host.free_page_count();
        let mut s2 = Stage2Table::create(&host, 4).unwrap();
        s2.map_range(&host, 0x4000_0000, 0x8000_0000, 0x3000, RW).unwrap();
        assert!(host.free_page_count() < free);
        s2.destroy(&host, &arch);
        assert_eq!(host.free_page_count(), free);
    }

    #[test]
    fn vmid_pool_exhausts() {
        let mut pool = VmidPool::new();
        let first = pool.alloc().unwrap();
        assert_eq!(first, 1);
        for _ in 0..254 {
            pool.alloc().unwrap();
        }
        assert_eq!(pool.alloc(), Err(Error::Busy));
        pool.free(first);
        assert_eq!(pool.alloc(), Ok(first));
    }
}
