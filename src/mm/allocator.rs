//! Bitmap page-frame allocator for the host RAM pool

use alloc::vec;
use alloc::vec::Vec;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

pub struct PageAllocator {
    base: u64,
    pages: usize,
    /// One bit per frame, set when allocated
    bitmap: Vec<u64>,
    allocated: usize,
}

impl PageAllocator {
    /// Manage `[base, base + size)`; both are truncated to whole pages
    pub fn new(base: u64, size: u64) -> Self {
        let start = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = (base + size) & !(PAGE_SIZE - 1);
        let pages = end.saturating_sub(start) as usize >> PAGE_SHIFT;
        Self {
            base: start,
            pages,
            bitmap: vec![0; pages.div_ceil(64)],
            allocated: 0,
        }
    }

    pub fn alloc_page(&mut self) -> Option<u64> {
        self.alloc_aligned(1, PAGE_SIZE)
    }

    /// First-fit run of `count` frames whose start is `align`-aligned
    pub fn alloc_aligned(&mut self, count: usize, align: u64) -> Option<u64> {
        if count == 0 || count > self.pages {
            return None;
        }
        let align = align.max(PAGE_SIZE);
        let mut first = self.first_aligned_from(0, align)?;

        while first + count <= self.pages {
            match (first..first + count).find(|&p| self.is_set(p)) {
                None => {
                    for p in first..first + count {
                        self.set(p);
                    }
                    self.allocated += count;
                    return Some(self.base + ((first as u64) << PAGE_SHIFT));
                }
                Some(busy) => first = self.first_aligned_from(busy + 1, align)?,
            }
        }
        None
    }

    pub fn alloc(&mut self, count: usize) -> Option<u64> {
        self.alloc_aligned(count, PAGE_SIZE)
    }

    /// Return frames; freeing a frame that is not allocated is a no-op
    pub fn free(&mut self, addr: u64, count: usize) {
        if addr < self.base {
            return;
        }
        let first = ((addr - self.base) >> PAGE_SHIFT) as usize;
        for p in first..(first + count).min(self.pages) {
            if self.is_set(p) {
                self.clear(p);
                self.allocated -= 1;
            }
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + ((self.pages as u64) << PAGE_SHIFT)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn total_pages(&self) -> usize {
        self.pages
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn remaining(&self) -> usize {
        self.pages - self.allocated
    }

    fn first_aligned_from(&self, page: usize, align: u64) -> Option<usize> {
        let addr = self.base + ((page as u64) << PAGE_SHIFT);
        let aligned = (addr + align - 1) & !(align - 1);
        let p = ((aligned - self.base) >> PAGE_SHIFT) as usize;
        (p < self.pages).then_some(p)
    }

    fn is_set(&self, p: usize) -> bool {
        self.bitmap[p / 64] & (1 << (p % 64)) != 0
    }

    fn set(&mut self, p: usize) {
        self.bitmap[p / 64] |= 1 << (p % 64);
    }

    fn clear(&mut self, p: usize) {
        self.bitmap[p / 64] &= !(1 << (p % 64));
    }
}
