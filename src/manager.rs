//! Guest and VCPU lifecycle
//!
//! Guests and VCPUs live in generational arenas. Handles that outlive
//! their object resolve to `NotAvail`.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{info, warn};

use crate::arch::traits::VcpuKind;
use crate::arch::VcpuRegs;
use crate::config::{GuestConfig, VcpuConfig};
use crate::error::{Error, Result};
use crate::guest::{Guest, GuestId};
use crate::hypervisor::Hypervisor;
use crate::mm::{HostMemFlags, Stage2Table};
use crate::percpu::CpuMask;
use crate::vcpu::{
    Vcpu, VcpuId, VcpuParams, VcpuState, WaitKind, IDLE_PRIORITY, MAX_PRIORITY,
    ORPHAN_STACK_PAGES,
};
use crate::vcpu_interrupt::DEFAULT_NR_VIRQS;

impl Hypervisor {
    pub fn guest_find(&self, id: GuestId) -> Option<Arc<Guest>> {
        self.guests.read().get(id.0).cloned()
    }

    pub(crate) fn guest_get(&self, id: GuestId) -> Result<Arc<Guest>> {
        self.guest_find(id).ok_or(Error::NotAvail)
    }

    pub fn guest_find_by_name(&self, name: &str) -> Option<Arc<Guest>> {
        self.guests.read().iter().map(|(_, g)| g).find(|g| g.name == name).cloned()
    }

    pub fn guest_ids(&self) -> Vec<GuestId> {
        self.guests.read().iter().map(|(id, _)| GuestId(id)).collect()
    }

    pub fn guest_count(&self) -> usize {
        self.guests.read().len()
    }

    pub fn vcpu_find(&self, id: VcpuId) -> Option<Arc<Vcpu>> {
        self.vcpus.read().get(id.0).cloned()
    }

    pub(crate) fn vcpu_get(&self, id: VcpuId) -> Result<Arc<Vcpu>> {
        self.vcpu_find(id).ok_or(Error::NotAvail)
    }

    pub fn vcpu_find_by_name(&self, name: &str) -> Option<Arc<Vcpu>> {
        self.vcpus.read().iter().map(|(_, v)| v).find(|v| v.name == name).cloned()
    }

    pub fn vcpu_ids(&self) -> Vec<VcpuId> {
        self.vcpus.read().iter().map(|(id, _)| VcpuId(id)).collect()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.read().len()
    }

    /// Create a guest with all its regions, devices and VCPUs.
    ///
    /// Nothing is left behind on failure. The VCPUs start in RESET.
    pub fn guest_create(&self, cfg: &GuestConfig) -> Result<GuestId> {
        if cfg.vcpus.is_empty() || cfg.name.is_empty() {
            return Err(Error::Invalid);
        }
        if self.guest_find_by_name(&cfg.name).is_some() {
            return Err(Error::Busy);
        }
        let vmid = self.vmids.lock().alloc()?;
        let table = match Stage2Table::create(&self.host, vmid) {
            Ok(t) => t,
            Err(e) => {
                self.vmids.lock().free(vmid);
                return Err(e);
            }
        };
        let raw = self
            .guests
            .write()
            .insert_with(|raw| Arc::new(Guest::new(GuestId(raw), &cfg.name, cfg.big_endian, cfg.irq_count, table)));
        let guest = self.guest_get(GuestId(raw))?;

        if let Err(e) = self.guest_populate(&guest, cfg) {
            warn!("guest {}: creation failed: {}", cfg.name, e);
            self.guest_teardown(&guest);
            return Err(e);
        }
        info!(
            "guest {}: {} vcpus, {} regions, vmid {}",
            guest.name,
            guest.vcpu_count(),
            guest.region_count(),
            vmid
        );
        Ok(guest.id)
    }

    fn guest_populate(&self, guest: &Arc<Guest>, cfg: &GuestConfig) -> Result {
        for region in cfg.regions.iter() {
            self.aspace_add(guest, region)?;
        }
        for (subid, vcfg) in cfg.vcpus.iter().enumerate() {
            let vcpu = self.vcpu_create_normal(guest, subid as u32, vcfg)?;
            guest.vcpus.write().push(vcpu.id);
        }
        Ok(())
    }

    fn vcpu_create_normal(&self, guest: &Guest, subid: u32, cfg: &VcpuConfig) -> Result<Arc<Vcpu>> {
        if cfg.priority > MAX_PRIORITY || cfg.priority == IDLE_PRIORITY {
            return Err(Error::Invalid);
        }
        let params = VcpuParams {
            name: format!("{}/{}", guest.name, cfg.name),
            kind: VcpuKind::Normal,
            subid,
            start_pc: cfg.start_pc,
            priority: cfg.priority,
            time_slice_ns: self.slice_or_default(cfg.time_slice_ns),
            affinity: cfg.affinity.unwrap_or_else(|| self.online_mask()),
            big_endian: guest.big_endian,
            nr_virqs: DEFAULT_NR_VIRQS,
            poweroff: cfg.poweroff,
        };
        self.vcpu_create(params, Some(guest.id), None)
    }

    fn vcpu_create(
        &self,
        params: VcpuParams,
        guest: Option<GuestId>,
        stack: Option<(usize, usize)>,
    ) -> Result<Arc<Vcpu>> {
        let affinity = params.affinity.and(self.online_mask());
        let host_cpu = affinity.first().ok_or(Error::Invalid)?;
        let params = VcpuParams { affinity, ..params };
        let now = self.timestamp();
        let raw = self.vcpus.write().insert_with(|raw| {
            Arc::new(Vcpu::new(VcpuId(raw), &params, guest, stack, host_cpu, now))
        });
        let vcpu = self.vcpu_get(VcpuId(raw))?;
        if let Err(e) = self.reinit(&vcpu) {
            self.vcpus.write().remove(raw);
            return Err(e);
        }
        Ok(vcpu)
    }

    pub(crate) fn online_mask(&self) -> CpuMask {
        CpuMask::all(self.cpus.len())
    }

    pub(crate) fn slice_or_default(&self, ns: u64) -> u64 {
        if ns != 0 {
            ns
        } else {
            self.default_slice_ns
        }
    }

    /// Destroy a guest whose VCPUs are all RESET or HALTED
    pub fn guest_destroy(&self, id: GuestId) -> Result {
        let guest = self.guest_get(id)?;
        for vid in guest.vcpu_ids() {
            if let Some(v) = self.vcpu_find(vid) {
                let s = v.sched.lock();
                if s.state.is_active() || s.on_cpu.is_some() {
                    return Err(Error::Busy);
                }
            }
        }
        self.guest_teardown(&guest);
        info!("guest {} destroyed", guest.name);
        Ok(())
    }

    fn guest_teardown(&self, guest: &Arc<Guest>) {
        let vcpus: Vec<VcpuId> = core::mem::take(&mut *guest.vcpus.write());
        for vid in vcpus {
            if let Some(v) = self.vcpu_find(vid) {
                self.vcpu_release(&v);
            }
        }
        self.aspace_teardown(guest);
        self.guests.write().remove(guest.id.0);
    }

    fn vcpu_release(&self, vcpu: &Arc<Vcpu>) {
        if let Err(e) = self.state_change(vcpu, VcpuState::Terminated) {
            warn!("{}: terminate failed: {}", vcpu.name, e);
        }
        self.wait_slot_clear(vcpu);
        self.private_owner_release(vcpu);
        if let Some((va, pages)) = vcpu.stack {
            if let Err(e) = self.host.free_pages(va, pages) {
                warn!("{}: stack free failed: {}", vcpu.name, e);
            }
        }
        self.vcpus.write().remove(vcpu.id.0);
    }

    fn wait_slot_clear(&self, vcpu: &Vcpu) {
        let mut slot = vcpu.wait.lock();
        slot.kind = WaitKind::None;
        slot.result = None;
        if let Some(ev) = slot.timer.take() {
            let _ = self.timer_event_destroy(ev);
        }
    }

    fn guest_for_each(&self, id: GuestId, mut f: impl FnMut(&Arc<Vcpu>)) -> Result {
        let guest = self.guest_get(id)?;
        for vid in guest.vcpu_ids() {
            if let Some(v) = self.vcpu_find(vid) {
                f(&v);
            }
        }
        Ok(())
    }

    /// Start every VCPU of the guest that is in RESET and not powered off
    pub fn guest_kick(&self, id: GuestId) -> Result {
        self.guest_for_each(id, |v| {
            if !v.poweroff && v.state() == VcpuState::Reset {
                let _ = self.state_change(v, VcpuState::Ready);
            }
        })
    }

    pub fn guest_pause(&self, id: GuestId) -> Result {
        self.guest_for_each(id, |v| {
            if matches!(v.state(), VcpuState::Ready | VcpuState::Running) {
                let _ = self.state_change(v, VcpuState::Paused);
            }
        })
    }

    pub fn guest_resume(&self, id: GuestId) -> Result {
        self.guest_for_each(id, |v| {
            if v.state() == VcpuState::Paused {
                let _ = self.state_change(v, VcpuState::Ready);
            }
        })
    }

    pub fn guest_halt(&self, id: GuestId) -> Result {
        self.guest_for_each(id, |v| {
            if v.state().is_active() {
                let _ = self.state_change(v, VcpuState::Halted);
            }
        })
    }

    /// Put every VCPU back to RESET and reset every emulated device
    pub fn guest_reset(&self, id: GuestId) -> Result {
        let guest = self.guest_get(id)?;
        for vid in guest.vcpu_ids() {
            self.vcpu_reset(vid)?;
        }
        self.aspace_reset(&guest);
        guest.reset_count.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        info!("guest {} reset", guest.name);
        Ok(())
    }

    pub fn vcpu_kick(&self, id: VcpuId) -> Result {
        let v = self.vcpu_get(id)?;
        self.state_change(&v, VcpuState::Ready)
    }

    pub fn vcpu_pause(&self, id: VcpuId) -> Result {
        let v = self.vcpu_get(id)?;
        self.state_change(&v, VcpuState::Paused)
    }

    pub fn vcpu_resume(&self, id: VcpuId) -> Result {
        let v = self.vcpu_get(id)?;
        if v.state() != VcpuState::Paused {
            return Err(Error::Invalid);
        }
        self.state_change(&v, VcpuState::Ready)
    }

    pub fn vcpu_halt(&self, id: VcpuId) -> Result {
        let v = self.vcpu_get(id)?;
        self.state_change(&v, VcpuState::Halted)
    }

    /// Back to RESET: registers, virtual IRQs and pending waits are cleared
    pub fn vcpu_reset(&self, id: VcpuId) -> Result {
        let v = self.vcpu_get(id)?;
        self.state_change(&v, VcpuState::Reset)?;
        v.virq.lock().reset();
        self.wait_slot_clear(&v);
        *v.mmio_cache.lock() = None;
        Ok(())
    }

    pub fn vcpu_state(&self, id: VcpuId) -> Result<VcpuState> {
        Ok(self.vcpu_get(id)?.state())
    }

    /// Register snapshot as of the VCPU's last switch-out or reset
    pub fn vcpu_regs(&self, id: VcpuId) -> Result<VcpuRegs> {
        Ok(self.vcpu_get(id)?.regs())
    }

    /// Create a hypervisor thread entering at `entry` on its own stack.
    /// The thread starts in RESET.
    pub fn orphan_create(
        &self,
        name: &str,
        entry: u64,
        priority: u8,
        time_slice_ns: u64,
        affinity: Option<CpuMask>,
    ) -> Result<VcpuId> {
        if priority > MAX_PRIORITY || priority == IDLE_PRIORITY {
            return Err(Error::Invalid);
        }
        let va = self.host.alloc_pages(ORPHAN_STACK_PAGES, HostMemFlags::NORMAL)?;
        let params = VcpuParams {
            name: String::from(name),
            kind: VcpuKind::Orphan,
            subid: 0,
            start_pc: entry,
            priority,
            time_slice_ns: self.slice_or_default(time_slice_ns),
            affinity: affinity.unwrap_or_else(|| self.online_mask()),
            big_endian: false,
            nr_virqs: 0,
            poweroff: false,
        };
        match self.vcpu_create(params, None, Some((va, ORPHAN_STACK_PAGES))) {
            Ok(v) => Ok(v.id),
            Err(e) => {
                let _ = self.host.free_pages(va, ORPHAN_STACK_PAGES);
                Err(e)
            }
        }
    }

    /// Destroy an orphan that is not on a CPU
    pub fn orphan_destroy(&self, id: VcpuId) -> Result {
        let v = self.vcpu_get(id)?;
        if v.is_normal() || self.is_idle_vcpu(id) {
            return Err(Error::Invalid);
        }
        {
            let s = v.sched.lock();
            if s.on_cpu.is_some() || s.state == VcpuState::Running {
                return Err(Error::Busy);
            }
        }
        self.vcpu_release(&v);
        Ok(())
    }

    /// Idle thread of `cpu`; never queued
    pub(crate) fn idle_create(&self, cpu: usize, entry: u64) -> Result<Arc<Vcpu>> {
        let params = VcpuParams {
            name: format!("idle/{}", cpu),
            kind: VcpuKind::Orphan,
            subid: 0,
            start_pc: entry,
            priority: IDLE_PRIORITY,
            time_slice_ns: self.default_slice_ns,
            affinity: CpuMask::single(cpu),
            big_endian: false,
            nr_virqs: 0,
            poweroff: false,
        };
        let va = self.host.alloc_pages(ORPHAN_STACK_PAGES, HostMemFlags::NORMAL)?;
        match self.vcpu_create(params, None, Some((va, ORPHAN_STACK_PAGES))) {
            Ok(v) => Ok(v),
            Err(e) => {
                let _ = self.host.free_pages(va, ORPHAN_STACK_PAGES);
                Err(e)
            }
        }
    }
}
