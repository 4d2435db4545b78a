//! Host address space: RAM frame pool, linear phys/virt mapping and I/O
//! mappings.
//!
//! The hypervisor runs with host RAM mapped at a fixed offset from its
//! physical address, so `va2pa`/`pa2va` are arithmetic for pool memory.
//! Device windows handed out by `iomap` are tracked so they can be
//! translated back and released.

use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, warn};

use super::allocator::{PageAllocator, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::sync::SpinLock;

bitflags! {
    /// Attributes requested for host memory
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HostMemFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const CACHEABLE = 1 << 3;
        /// Zero the pages before handing them out
        const ZERO = 1 << 4;
    }
}

impl HostMemFlags {
    pub const NORMAL: HostMemFlags = HostMemFlags::READ
        .union(HostMemFlags::WRITE)
        .union(HostMemFlags::CACHEABLE);
}

/// Host RAM handed to the pool allocator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostRamPool {
    pub phys_base: u64,
    pub size: u64,
    /// Virtual address at which `phys_base` is mapped
    pub virt_base: usize,
}

#[derive(Clone, Copy, Debug)]
struct IoMapping {
    va: usize,
    pa: u64,
    size: usize,
}

pub struct HostAspace {
    pool: SpinLock<PageAllocator>,
    ram: HostRamPool,
    io: SpinLock<Vec<IoMapping>>,
}

impl HostAspace {
    pub fn new(ram: HostRamPool) -> Self {
        debug!(
            "host aspace: pool pa {:#x} size {:#x} va {:#x}",
            ram.phys_base, ram.size, ram.virt_base
        );
        Self {
            pool: SpinLock::new(PageAllocator::new(ram.phys_base, ram.size)),
            ram,
            io: SpinLock::new(Vec::new()),
        }
    }

    /// Allocate `count` contiguous pages and return their virtual address
    pub fn alloc_pages(&self, count: usize, flags: HostMemFlags) -> Result<usize> {
        self.alloc_aligned(count, PAGE_SIZE, flags)
    }

    pub fn alloc_aligned(&self, count: usize, align: u64, flags: HostMemFlags) -> Result<usize> {
        if count == 0 {
            return Err(Error::Invalid);
        }
        let pa = self
            .pool
            .lock()
            .alloc_aligned(count, align)
            .ok_or(Error::NoMem)?;
        let va = self.pa2va(pa);
        if flags.contains(HostMemFlags::ZERO) {
            // SAFETY: the frames were just taken from the pool, which is
            // mapped at `virt_base` and owned by nobody else.
            unsafe { core::ptr::write_bytes(va as *mut u8, 0, count * PAGE_SIZE as usize) };
        }
        Ok(va)
    }

    pub fn free_pages(&self, va: usize, count: usize) -> Result {
        let pa = self.va2pa(va)?;
        let mut pool = self.pool.lock();
        if !pool.contains(pa) {
            return Err(Error::Invalid);
        }
        pool.free(pa, count);
        Ok(())
    }

    /// Allocate one zeroed page and return its physical address
    pub fn alloc_zeroed_frame(&self) -> Result<u64> {
        let va = self.alloc_pages(1, HostMemFlags::NORMAL | HostMemFlags::ZERO)?;
        self.va2pa(va)
    }

    pub fn free_frame(&self, pa: u64) {
        self.pool.lock().free(pa, 1);
    }

    /// Map a device window
    ///
    /// Device memory is reachable through the same linear offset as RAM.
    pub fn iomap(&self, pa: u64, size: usize) -> Result<usize> {
        if size == 0 {
            return Err(Error::Invalid);
        }
        let mut io = self.io.lock();
        if io.iter().any(|m| pa < m.pa + m.size as u64 && m.pa < pa + size as u64) {
            return Err(Error::Overlap);
        }
        let va = self.pa2va(pa);
        io.push(IoMapping { va, pa, size });
        Ok(va)
    }

    pub fn iounmap(&self, va: usize, size: usize) -> Result {
        let mut io = self.io.lock();
        let idx = io
            .iter()
            .position(|m| m.va == va && m.size == size)
            .ok_or(Error::NotAvail)?;
        io.swap_remove(idx);
        Ok(())
    }

    /// Translate a host virtual address from the pool or an I/O window
    pub fn va2pa(&self, va: usize) -> Result<u64> {
        let ram_end = self.ram.virt_base + self.ram.size as usize;
        if va >= self.ram.virt_base && va < ram_end {
            return Ok(self.ram.phys_base + (va - self.ram.virt_base) as u64);
        }
        self.io
            .lock()
            .iter()
            .find(|m| va >= m.va && va < m.va + m.size)
            .map(|m| m.pa + (va - m.va) as u64)
            .ok_or_else(|| {
                warn!("va2pa: {:#x} is not mapped", va);
                Error::NotAvail
            })
    }

    /// Linear-map translation of any host physical address
    pub fn pa2va(&self, pa: u64) -> usize {
        (pa.wrapping_sub(self.ram.phys_base) as usize).wrapping_add(self.ram.virt_base)
    }

    pub fn free_page_count(&self) -> usize {
        self.pool.lock().remaining()
    }

    pub fn ram(&self) -> HostRamPool {
        self.ram
    }
}
