//! Guest address space: region add/remove, second-stage population and
//! the stage-2 fault policy.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, trace, warn};

use super::region::{Region, RegionFlags, RegionKind, RegionMap, RegionType};
use super::{AccessKind, Guest, GuestId, Stage2Fault};
use crate::arch::aarch64::mm::mmu::LEAF_SIZES;
use crate::arch::intrinsics;
use crate::arch::traits::{GuestException, Stage2Root};
use crate::arch::VcpuRegs;
use crate::config::RegionConfig;
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use crate::mm::{best_page_size, HostMemFlags, MapFlags, PAGE_SIZE};
use crate::vcpu::{Vcpu, VcpuState};

/// Region map change reported to notifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspaceEvent {
    RegionAdded { base: u64, size: u64, kind: RegionType },
    RegionRemoved { base: u64, size: u64, kind: RegionType },
    Reset,
}

pub type AspaceNotifier = Arc<dyn Fn(&Guest, &AspaceEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(u64);

static NEXT_NOTIFIER: AtomicU64 = AtomicU64::new(1);

/// How a stage-2 fault was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A translation was installed; the instruction is retried
    Mapped,
    /// An emulator completed the access and the PC moved past it
    Emulated,
    /// A synchronous abort was injected into the guest
    AbortInjected,
    /// The VCPU could not continue and was halted
    Halted,
}

/// Where a guest address leads once aliases are followed
enum Resolved {
    /// RAM or ROM. `region` bounds the mapping, `hpa_base` backs its base.
    Memory {
        region: Region,
        hpa_base: u64,
        flags: RegionFlags,
        rom: bool,
    },
    Emulated(Region),
    Nothing,
}

fn resolve(map: &RegionMap, gpa: u64) -> Resolved {
    let Some(r) = map.find(gpa) else {
        return Resolved::Nothing;
    };
    match r.kind {
        RegionKind::Ram { hpa } | RegionKind::Rom { hpa } => Resolved::Memory {
            region: r.clone(),
            hpa_base: hpa,
            flags: r.flags,
            rom: r.kind.region_type() == RegionType::Rom,
        },
        RegionKind::Alias { target } => {
            let Some(t) = map.find(target) else {
                return Resolved::Nothing;
            };
            if t.end() < target + r.size {
                return Resolved::Nothing;
            }
            match t.host_addr(target) {
                Some(hpa_base) => Resolved::Memory {
                    region: r.clone(),
                    hpa_base,
                    flags: r.flags & t.flags,
                    rom: t.kind.region_type() == RegionType::Rom,
                },
                None => Resolved::Nothing,
            }
        }
        RegionKind::Emulated(_) => Resolved::Emulated(r.clone()),
        RegionKind::Reserved => Resolved::Nothing,
    }
}

fn map_flags(flags: RegionFlags, rom: bool) -> MapFlags {
    let mut out = MapFlags::empty();
    out.set(MapFlags::READ, flags.contains(RegionFlags::READ));
    out.set(MapFlags::WRITE, flags.contains(RegionFlags::WRITE) && !rom);
    out.set(MapFlags::EXEC, flags.contains(RegionFlags::EXEC));
    out.set(MapFlags::CACHEABLE, flags.contains(RegionFlags::CACHEABLE));
    out
}

/// Largest leaf around `gpa` that stays inside the region
fn fault_block(region: &Region, hpa_base: u64, gpa: u64) -> (u64, u64) {
    for &(size, _) in LEAF_SIZES.iter() {
        let blk = gpa & !(size - 1);
        if blk < region.base || blk + size > region.end() {
            continue;
        }
        let hpa = hpa_base + (blk - region.base);
        if best_page_size(blk, hpa, region.end() - blk) >= size {
            return (blk, size);
        }
    }
    (gpa & !(PAGE_SIZE - 1), PAGE_SIZE)
}

fn page_count(size: u64) -> usize {
    (size / PAGE_SIZE) as usize
}

impl Hypervisor {
    /// Add a region described by `cfg` to the guest's map
    pub fn guest_add_region(&self, gid: GuestId, cfg: &RegionConfig) -> Result {
        let guest = self.guest_get(gid)?;
        self.aspace_add(&guest, cfg)
    }

    /// Remove the region starting at `gpa`, unmapping it from every CPU
    pub fn guest_remove_region(&self, gid: GuestId, gpa: u64) -> Result {
        let guest = self.guest_get(gid)?;
        self.aspace_remove(&guest, gpa)
    }

    pub fn guest_find_region(&self, gid: GuestId, gpa: u64) -> Option<Region> {
        self.guest_find(gid)?.find_region(gpa)
    }

    /// Install the stage-2 translation of `[gpa, gpa + size)` and return
    /// the host address backing `gpa`
    pub fn guest_map(&self, gid: GuestId, gpa: u64, size: u64) -> Result<u64> {
        let guest = self.guest_get(gid)?;
        let resolved = resolve(&guest.regions.read(), gpa);
        let Resolved::Memory { region, hpa_base, flags, rom } = resolved else {
            return Err(Error::Invalid);
        };
        let start = gpa & !(PAGE_SIZE - 1);
        let end = gpa
            .checked_add(size.max(1))
            .map(|e| (e + PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
            .ok_or(Error::Invalid)?;
        if end > region.end() {
            return Err(Error::Invalid);
        }
        let hpa = hpa_base + (start - region.base);
        let mut table = guest.stage2.lock();
        let table = table.as_mut().ok_or(Error::NotAvail)?;
        table.map_range(&self.host, start, hpa, end - start, map_flags(flags, rom))?;
        Ok(hpa_base + (gpa - region.base))
    }

    /// Host address, flags and leaf size the stage-2 table holds for `gpa`
    pub fn guest_translate(&self, gid: GuestId, gpa: u64) -> Option<(u64, MapFlags, u64)> {
        let guest = self.guest_find(gid)?;
        let table = guest.stage2.lock();
        table.as_ref()?.translate(&self.host, gpa)
    }

    /// Change the access rights of mapped pages in `[gpa, gpa + size)`
    pub fn guest_protect(&self, gid: GuestId, gpa: u64, size: u64, flags: MapFlags) -> Result {
        let guest = self.guest_get(gid)?;
        let mut table = guest.stage2.lock();
        let table = table.as_mut().ok_or(Error::NotAvail)?;
        table.protect(&self.host, self.arch.as_ref(), gpa, size, flags)
    }

    /// Copy guest memory into `buf`. Returns the bytes copied, which stop
    /// short at the first address that is not RAM or ROM.
    pub fn guest_physical_read(&self, gid: GuestId, gpa: u64, buf: &mut [u8]) -> Result<usize> {
        let guest = self.guest_get(gid)?;
        let map = guest.regions.read();
        let mut done = 0;
        while done < buf.len() {
            let addr = gpa + done as u64;
            let Resolved::Memory { region, hpa_base, .. } = resolve(&map, addr) else {
                break;
            };
            let n = ((region.end() - addr) as usize).min(buf.len() - done);
            let va = self.host.pa2va(hpa_base + (addr - region.base));
            // SAFETY: the range lies inside a RAM/ROM region whose backing is
            // host RAM mapped at `va`.
            unsafe {
                core::ptr::copy_nonoverlapping(va as *const u8, buf[done..].as_mut_ptr(), n);
            }
            done += n;
        }
        if done == 0 && !buf.is_empty() {
            return Err(Error::Fault);
        }
        Ok(done)
    }

    /// Copy `buf` into guest memory, ROM included
    pub fn guest_physical_write(&self, gid: GuestId, gpa: u64, buf: &[u8]) -> Result<usize> {
        let guest = self.guest_get(gid)?;
        let map = guest.regions.read();
        let mut done = 0;
        while done < buf.len() {
            let addr = gpa + done as u64;
            let Resolved::Memory { region, hpa_base, .. } = resolve(&map, addr) else {
                break;
            };
            let n = ((region.end() - addr) as usize).min(buf.len() - done);
            let va = self.host.pa2va(hpa_base + (addr - region.base));
            // SAFETY: as in `guest_physical_read`.
            unsafe {
                core::ptr::copy_nonoverlapping(buf[done..].as_ptr(), va as *mut u8, n);
            }
            intrinsics::flush_dcache_range(va, va + n);
            done += n;
        }
        if done == 0 && !buf.is_empty() {
            return Err(Error::Fault);
        }
        Ok(done)
    }

    pub fn guest_aspace_register_notifier(&self, gid: GuestId, f: AspaceNotifier) -> Result<NotifierId> {
        let guest = self.guest_get(gid)?;
        let id = NotifierId(NEXT_NOTIFIER.fetch_add(1, Ordering::Relaxed));
        guest.notifiers.lock().push((id, f));
        Ok(id)
    }

    pub fn guest_aspace_unregister_notifier(&self, gid: GuestId, id: NotifierId) -> Result {
        let guest = self.guest_get(gid)?;
        let mut list = guest.notifiers.lock();
        let pos = list.iter().position(|(n, _)| *n == id).ok_or(Error::NotAvail)?;
        list.remove(pos);
        Ok(())
    }

    pub(crate) fn guest_stage2_root(&self, gid: GuestId) -> Option<Stage2Root> {
        self.guest_find(gid).map(|g| g.stage2_root())
    }

    fn aspace_notify(&self, guest: &Guest, event: AspaceEvent) {
        let list: Vec<AspaceNotifier> = guest.notifiers.lock().iter().map(|(_, f)| f.clone()).collect();
        for f in list {
            f(guest, &event);
        }
    }

    pub(crate) fn aspace_add(&self, guest: &Arc<Guest>, cfg: &RegionConfig) -> Result {
        if cfg.size == 0 || (cfg.gpa | cfg.size) % PAGE_SIZE != 0 {
            return Err(Error::Invalid);
        }
        if cfg.align != 0 && !cfg.align.is_power_of_two() {
            return Err(Error::Invalid);
        }
        let mut flags = cfg.flags;
        let kind = match cfg.kind {
            RegionType::Ram | RegionType::Rom => {
                let hpa = match cfg.host_phys {
                    Some(pa) => {
                        flags.remove(RegionFlags::ALLOC);
                        pa
                    }
                    None => {
                        let align = cfg.align.max(PAGE_SIZE);
                        let va = self.host.alloc_aligned(
                            page_count(cfg.size),
                            align,
                            HostMemFlags::NORMAL | HostMemFlags::ZERO,
                        )?;
                        flags.insert(RegionFlags::ALLOC);
                        self.host.va2pa(va)?
                    }
                };
                if cfg.align != 0 && hpa % cfg.align != 0 {
                    return Err(Error::Invalid);
                }
                if cfg.kind == RegionType::Ram {
                    RegionKind::Ram { hpa }
                } else {
                    RegionKind::Rom { hpa }
                }
            }
            RegionType::Alias => {
                let target = cfg.alias_phys.ok_or(Error::Invalid)?;
                let map = guest.regions.read();
                let t = map.find(target).ok_or(Error::Invalid)?;
                let backed = matches!(t.kind, RegionKind::Ram { .. } | RegionKind::Rom { .. });
                if !backed || target + cfg.size > t.end() {
                    return Err(Error::Invalid);
                }
                flags.remove(RegionFlags::ALLOC);
                RegionKind::Alias { target }
            }
            RegionType::Emulated => {
                let compat = cfg.emulator.as_deref().ok_or(Error::Invalid)?;
                flags.remove(RegionFlags::ALLOC | RegionFlags::EAGER);
                RegionKind::Emulated(self.emu_probe(guest, cfg, compat)?)
            }
            RegionType::Reserved => {
                flags.remove(RegionFlags::ALLOC | RegionFlags::EAGER);
                RegionKind::Reserved
            }
        };
        let region = Region {
            name: cfg.name.clone(),
            base: cfg.gpa,
            size: cfg.size,
            kind,
            flags,
        };

        if let Err(e) = guest.regions.write().insert(region.clone()) {
            self.region_release(guest, &region);
            return Err(e);
        }
        guest.generation.fetch_add(1, Ordering::AcqRel);

        if flags.contains(RegionFlags::EAGER) {
            let populated = self.guest_map(guest.id, region.base, region.size);
            if let Err(e) = populated {
                warn!("{}: eager map of {} failed: {}", guest.name, region.name, e);
                let _ = self.aspace_remove(guest, region.base);
                return Err(e);
            }
        }

        debug!(
            "{}: region {} {:#x}+{:#x} {:?}",
            guest.name, region.name, region.base, region.size, region.kind
        );
        self.aspace_notify(
            guest,
            AspaceEvent::RegionAdded {
                base: region.base,
                size: region.size,
                kind: region.kind.region_type(),
            },
        );
        Ok(())
    }

    pub(crate) fn aspace_remove(&self, guest: &Guest, gpa: u64) -> Result {
        let region = {
            let mut map = guest.regions.write();
            // Aliases of a backed region must go first
            let target = map
                .find(gpa)
                .filter(|r| r.base == gpa)
                .filter(|r| matches!(r.kind, RegionKind::Ram { .. } | RegionKind::Rom { .. }));
            if let Some(r) = target {
                if map.is_aliased(r.base, r.size) {
                    return Err(Error::Busy);
                }
            }
            map.remove(gpa)?
        };
        guest.generation.fetch_add(1, Ordering::AcqRel);

        if matches!(
            region.kind,
            RegionKind::Ram { .. } | RegionKind::Rom { .. } | RegionKind::Alias { .. }
        ) {
            let mut table = guest.stage2.lock();
            if let Some(table) = table.as_mut() {
                table.unmap_page(&self.host, self.arch.as_ref(), region.base, region.size)?;
            }
        }
        self.region_release(guest, &region);
        self.aspace_notify(
            guest,
            AspaceEvent::RegionRemoved {
                base: region.base,
                size: region.size,
                kind: region.kind.region_type(),
            },
        );
        Ok(())
    }

    fn region_release(&self, guest: &Guest, region: &Region) {
        match &region.kind {
            RegionKind::Ram { hpa } | RegionKind::Rom { hpa }
                if region.flags.contains(RegionFlags::ALLOC) =>
            {
                let va = self.host.pa2va(*hpa);
                if let Err(e) = self.host.free_pages(va, page_count(region.size)) {
                    warn!("{}: freeing {} failed: {}", guest.name, region.name, e);
                }
            }
            RegionKind::Emulated(inst) => self.emu_remove(guest, inst),
            _ => {}
        }
    }

    /// Reset emulated devices and tell the notifiers
    pub(crate) fn aspace_reset(&self, guest: &Guest) {
        let regions = guest.regions();
        for region in regions.iter() {
            if let RegionKind::Emulated(inst) = &region.kind {
                self.emu_reset(guest, inst);
            }
        }
        self.aspace_notify(guest, AspaceEvent::Reset);
    }

    /// Drop every region and the stage-2 tree
    pub(crate) fn aspace_teardown(&self, guest: &Guest) {
        let regions = guest.regions.write().drain();
        guest.generation.fetch_add(1, Ordering::AcqRel);
        for region in regions.iter() {
            self.region_release(guest, region);
        }
        if let Some(table) = guest.stage2.lock().take() {
            let vmid = table.vmid();
            table.destroy(&self.host, self.arch.as_ref());
            self.vmids.lock().free(vmid);
        }
    }

    /// Stage-2 fault policy for the VCPU running on `cpu`
    pub(crate) fn guest_handle_fault(
        &self,
        cpu: usize,
        vcpu: &Vcpu,
        guest: &Guest,
        regs: &mut VcpuRegs,
        fault: &Stage2Fault,
    ) -> FaultOutcome {
        let gpa = fault.gpa;
        if fault.mmio.is_some() {
            let cached = {
                let cache = vcpu.mmio_cache.lock();
                cache
                    .as_ref()
                    .filter(|(gen, r)| *gen == guest.generation() && r.contains(gpa))
                    .map(|(_, r)| r.clone())
            };
            if let Some(region) = cached {
                return self.fault_emulate(cpu, vcpu, guest, regs, fault, &region);
            }
        }

        let generation = guest.generation();
        let resolved = resolve(&guest.regions.read(), gpa);
        match resolved {
            Resolved::Memory { region, hpa_base, flags, rom } => {
                let allowed = match fault.access {
                    AccessKind::Read => flags.contains(RegionFlags::READ),
                    AccessKind::Write => flags.contains(RegionFlags::WRITE) && !rom,
                    AccessKind::Exec => flags.contains(RegionFlags::EXEC),
                };
                if !allowed {
                    debug!("{}: {:?} to {:#x} denied", vcpu.name, fault.access, gpa);
                    return self.inject_abort(cpu, vcpu, regs, fault);
                }
                let (blk, size) = fault_block(&region, hpa_base, gpa);
                let hpa = hpa_base + (blk - region.base);
                let mapped = {
                    let mut table = guest.stage2.lock();
                    match table.as_mut() {
                        Some(t) => match t.map_page(&self.host, blk, hpa, size, map_flags(flags, rom)) {
                            // Present with other rights or at a finer size
                            Err(Error::Overlap) => t.reprotect_leaf(
                                &self.host,
                                self.arch.as_ref(),
                                gpa,
                                hpa_base + (gpa - region.base),
                                map_flags(flags, rom),
                            ),
                            r => r,
                        },
                        None => Err(Error::NotAvail),
                    }
                };
                match mapped {
                    Ok(()) => {
                        trace!("{}: mapped {:#x}+{:#x} -> {:#x}", vcpu.name, blk, size, hpa);
                        FaultOutcome::Mapped
                    }
                    Err(e) => {
                        error!("{}: mapping {:#x} failed: {}", vcpu.name, gpa, e);
                        self.halt_faulting(vcpu)
                    }
                }
            }
            Resolved::Emulated(region) => {
                *vcpu.mmio_cache.lock() = Some((generation, region.clone()));
                self.fault_emulate(cpu, vcpu, guest, regs, fault, &region)
            }
            Resolved::Nothing => {
                debug!("{}: no region at {:#x}", vcpu.name, gpa);
                self.inject_abort(cpu, vcpu, regs, fault)
            }
        }
    }

    fn fault_emulate(
        &self,
        cpu: usize,
        vcpu: &Vcpu,
        guest: &Guest,
        regs: &mut VcpuRegs,
        fault: &Stage2Fault,
        region: &Region,
    ) -> FaultOutcome {
        let (RegionKind::Emulated(inst), Some(info)) = (&region.kind, fault.mmio.as_ref()) else {
            return self.inject_abort(cpu, vcpu, regs, fault);
        };
        match self.emulate_mmio(guest, vcpu, inst, region.base, fault.gpa, info, regs) {
            Ok(()) => FaultOutcome::Emulated,
            Err(e) => {
                debug!("{}: emulation at {:#x} failed: {}", vcpu.name, fault.gpa, e);
                self.inject_abort(cpu, vcpu, regs, fault)
            }
        }
    }

    fn inject_abort(&self, cpu: usize, vcpu: &Vcpu, regs: &mut VcpuRegs, fault: &Stage2Fault) -> FaultOutcome {
        let exc = match fault.access {
            AccessKind::Exec => GuestException::InstructionAbort { fault_addr: fault.gva },
            access => GuestException::DataAbort {
                fault_addr: fault.gva,
                write: access == AccessKind::Write,
            },
        };
        match self.arch.inject_exception(cpu, regs, &exc) {
            Ok(()) => FaultOutcome::AbortInjected,
            Err(e) => {
                error!("{}: abort injection failed: {}", vcpu.name, e);
                self.halt_faulting(vcpu)
            }
        }
    }

    fn halt_faulting(&self, vcpu: &Vcpu) -> FaultOutcome {
        if let Err(e) = self.state_change(vcpu, VcpuState::Halted) {
            warn!("{}: halt failed: {}", vcpu.name, e);
        }
        FaultOutcome::Halted
    }
}
