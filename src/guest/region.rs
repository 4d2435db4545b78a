//! Guest-physical region map
//!
//! Regions are kept sorted by base address, so a lookup is a binary search.
//! Pairwise disjointness is checked on insertion.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::devices::EmuInstance;
use crate::error::{Error, Result};
use crate::mm::PAGE_SIZE;

bitflags! {
    /// Access rights and backing policy of a region
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const CACHEABLE = 1 << 3;
        /// Populate the stage-2 table when the region is added
        const EAGER = 1 << 4;
        /// Backing frames come from the host pool and return there
        const ALLOC = 1 << 5;
    }
}

impl RegionFlags {
    pub const RAM: RegionFlags = RegionFlags::READ
        .union(RegionFlags::WRITE)
        .union(RegionFlags::EXEC)
        .union(RegionFlags::CACHEABLE);
    pub const ROM: RegionFlags = RegionFlags::READ
        .union(RegionFlags::EXEC)
        .union(RegionFlags::CACHEABLE);
}

/// Type tag of a region, as written in configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionType {
    Ram,
    Rom,
    Alias,
    Emulated,
    Reserved,
}

impl RegionType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ram" => Ok(RegionType::Ram),
            "rom" => Ok(RegionType::Rom),
            "alias" => Ok(RegionType::Alias),
            "emulated" => Ok(RegionType::Emulated),
            "reserved" => Ok(RegionType::Reserved),
            _ => Err(Error::Invalid),
        }
    }
}

/// Backing of a region
#[derive(Clone)]
pub enum RegionKind {
    Ram { hpa: u64 },
    Rom { hpa: u64 },
    /// Same contents as the guest range starting at `target`
    Alias { target: u64 },
    Emulated(Arc<EmuInstance>),
    Reserved,
}

impl RegionKind {
    pub fn region_type(&self) -> RegionType {
        match self {
            RegionKind::Ram { .. } => RegionType::Ram,
            RegionKind::Rom { .. } => RegionType::Rom,
            RegionKind::Alias { .. } => RegionType::Alias,
            RegionKind::Emulated(_) => RegionType::Emulated,
            RegionKind::Reserved => RegionType::Reserved,
        }
    }
}

impl fmt::Debug for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Ram { hpa } => write!(f, "Ram({:#x})", hpa),
            RegionKind::Rom { hpa } => write!(f, "Rom({:#x})", hpa),
            RegionKind::Alias { target } => write!(f, "Alias({:#x})", target),
            RegionKind::Emulated(inst) => write!(f, "Emulated({})", inst.name()),
            RegionKind::Reserved => f.write_str("Reserved"),
        }
    }
}

/// Half-open guest-physical range `[base, base + size)`
#[derive(Clone, Debug)]
pub struct Region {
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub kind: RegionKind,
    pub flags: RegionFlags,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.base && gpa < self.end()
    }

    pub fn overlaps(&self, base: u64, size: u64) -> bool {
        base < self.end() && self.base < base + size
    }

    /// Host address backing `gpa` for RAM and ROM
    pub fn host_addr(&self, gpa: u64) -> Option<u64> {
        match self.kind {
            RegionKind::Ram { hpa } | RegionKind::Rom { hpa } if self.contains(gpa) => {
                Some(hpa + (gpa - self.base))
            }
            _ => None,
        }
    }
}

/// Sorted, disjoint set of regions
#[derive(Default)]
pub struct RegionMap {
    regions: Vec<Region>,
}

impl RegionMap {
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    pub fn insert(&mut self, region: Region) -> Result {
        if region.size == 0 || (region.base | region.size) % PAGE_SIZE != 0 {
            return Err(Error::Invalid);
        }
        region.base.checked_add(region.size).ok_or(Error::Invalid)?;
        let pos = self.regions.partition_point(|r| r.base < region.base);
        let clash_prev = pos > 0 && self.regions[pos - 1].end() > region.base;
        let clash_next = pos < self.regions.len() && self.regions[pos].base < region.end();
        if clash_prev || clash_next {
            return Err(Error::Overlap);
        }
        self.regions.insert(pos, region);
        Ok(())
    }

    /// Remove the region starting exactly at `base`
    pub fn remove(&mut self, base: u64) -> Result<Region> {
        let pos = self
            .regions
            .binary_search_by_key(&base, |r| r.base)
            .map_err(|_| Error::NotAvail)?;
        Ok(self.regions.remove(pos))
    }

    pub fn find(&self, gpa: u64) -> Option<&Region> {
        let pos = self.regions.partition_point(|r| r.base <= gpa);
        let r = self.regions.get(pos.checked_sub(1)?)?;
        r.contains(gpa).then_some(r)
    }

    /// Whether an alias region points into `[base, base + size)`
    pub fn is_aliased(&self, base: u64, size: u64) -> bool {
        self.regions.iter().any(|r| match r.kind {
            RegionKind::Alias { target } => target < base + size && base < target + r.size,
            _ => false,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub(crate) fn drain(&mut self) -> Vec<Region> {
        core::mem::take(&mut self.regions)
    }
}
