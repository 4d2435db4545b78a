//! Device Emulation Framework
//!
//! Emulators register once and are matched by `compatible` string when a
//! guest region of type EMULATED is added. Each match creates one device
//! instance owned by the region. Guest accesses to the region always trap;
//! the dispatcher here performs the access on the instance and completes
//! the trapped load/store.
//!
//! Emulators work in their own declared byte order. Conversion to the
//! guest's data endianness happens only in `emulate_mmio`.

pub mod pl031;
pub mod zero;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info, warn};
use spin::RwLock;

use crate::arch::traits::VcpuContextOps;
use crate::arch::VcpuRegs;
use crate::config::RegionConfig;
use crate::error::{Error, Result};
use crate::guest::{Guest, GuestId, GuestIrqEvent};
use crate::hypervisor::Hypervisor;
use crate::sync::SpinLock;
use crate::vcpu::{Vcpu, VcpuId};

/// Decoded guest load/store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioInfo {
    pub write: bool,
    /// 1, 2, 4 or 8
    pub size: u8,
    /// Source or destination general register
    pub reg: u8,
    pub sign_extend: bool,
    /// Destination is a 64-bit register
    pub reg_64bit: bool,
    /// Guest performs big-endian data accesses
    pub big_endian: bool,
    pub insn_len: u64,
}

/// Byte order an emulator's registers use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
    /// Host byte order
    Native,
}

impl Endian {
    fn is_big(self) -> bool {
        match self {
            Endian::Little => false,
            Endian::Big => true,
            Endian::Native => cfg!(target_endian = "big"),
        }
    }
}

/// Region an instance was probed for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmuDeviceInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
    /// Virtual IRQ the device raises, if any
    pub irq: Option<u32>,
}

/// What an emulator may touch while handling an access
pub struct EmuContext<'a> {
    hv: &'a Hypervisor,
    guest: GuestId,
    vcpu: Option<VcpuId>,
}

impl<'a> EmuContext<'a> {
    pub fn new(hv: &'a Hypervisor, guest: GuestId, vcpu: Option<VcpuId>) -> Self {
        Self { hv, guest, vcpu }
    }

    pub fn hv(&self) -> &'a Hypervisor {
        self.hv
    }

    pub fn guest(&self) -> GuestId {
        self.guest
    }

    /// VCPU whose access is being emulated
    pub fn vcpu(&self) -> Option<VcpuId> {
        self.vcpu
    }

    pub fn timestamp(&self) -> u64 {
        self.hv.timestamp()
    }

    /// VCPU `subid` of the owning guest
    pub fn guest_vcpu(&self, subid: u32) -> Option<VcpuId> {
        let guest = self.hv.guest_find(self.guest)?;
        let id = guest.vcpus.read().get(subid as usize).copied();
        id
    }

    /// Raise guest line `irq`; unrouted lines reach the boot VCPU
    pub fn irq_assert(&self, irq: u32, reason: u32) -> Result {
        self.irq_level(irq, None, true, reason)
    }

    pub fn irq_deassert(&self, irq: u32) -> Result {
        self.irq_level(irq, None, false, 0)
    }

    /// Change the level of guest line `irq` aimed at VCPU `cpu`
    pub fn irq_level(&self, irq: u32, cpu: Option<u32>, level: bool, reason: u32) -> Result {
        let event = GuestIrqEvent {
            irq,
            cpu,
            level,
            reason,
        };
        self.hv.guest_emulate_irq(self.guest, &event)
    }
}

/// A device model, registered once
pub trait Emulator: Send + Sync {
    fn name(&self) -> &str;
    /// `compatible` strings this emulator serves
    fn compatible(&self) -> &[&str];
    fn endian(&self) -> Endian;
    fn probe(&self, ctx: &EmuContext, info: &EmuDeviceInfo) -> Result<Box<dyn EmulatedDevice>>;
}

/// One emulated device instance
///
/// Offsets are relative to the region base. `size` is 1, 2, 4 or 8.
/// Handlers must not block.
pub trait EmulatedDevice: Send {
    fn reset(&mut self, _ctx: &EmuContext) -> Result {
        Ok(())
    }

    fn read(&mut self, ctx: &EmuContext, offset: u64, size: u8) -> Result<u64>;

    /// `mask` selects the bits of `value` the access writes
    fn write(&mut self, ctx: &EmuContext, offset: u64, value: u64, size: u8, mask: u64) -> Result;

    fn remove(&mut self, _ctx: &EmuContext) {}
}

/// A probed device bound to a guest region
pub struct EmuInstance {
    info: EmuDeviceInfo,
    compatible: String,
    emulator: Arc<dyn Emulator>,
    endian: Endian,
    device: SpinLock<Box<dyn EmulatedDevice>>,
}

impl EmuInstance {
    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn compatible(&self) -> &str {
        &self.compatible
    }

    pub fn emulator_name(&self) -> &str {
        self.emulator.name()
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn info(&self) -> &EmuDeviceInfo {
        &self.info
    }
}

/// Registered emulators
pub(crate) struct EmulatorRegistry {
    list: RwLock<Vec<Arc<dyn Emulator>>>,
}

impl EmulatorRegistry {
    pub(crate) fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
        }
    }

    fn register(&self, emu: Arc<dyn Emulator>) -> Result {
        let mut list = self.list.write();
        if list.iter().any(|e| e.name() == emu.name()) {
            return Err(Error::Busy);
        }
        list.push(emu);
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result {
        let mut list = self.list.write();
        let pos = list.iter().position(|e| e.name() == name).ok_or(Error::NotAvail)?;
        list.remove(pos);
        Ok(())
    }

    fn find(&self, compatible: &str) -> Option<Arc<dyn Emulator>> {
        self.list
            .read()
            .iter()
            .find(|e| e.compatible().contains(&compatible))
            .cloned()
    }
}

fn size_mask(size: u8) -> u64 {
    match size {
        8 => u64::MAX,
        n => (1u64 << (n as u32 * 8)) - 1,
    }
}

fn swap_bytes(val: u64, size: u8) -> u64 {
    match size {
        1 => val,
        2 => (val as u16).swap_bytes() as u64,
        4 => (val as u32).swap_bytes() as u64,
        _ => val.swap_bytes(),
    }
}

fn sign_extend(val: u64, size: u8) -> u64 {
    let shift = 64 - size as u32 * 8;
    (((val << shift) as i64) >> shift) as u64
}

impl Hypervisor {
    pub fn emulator_register(&self, emu: Arc<dyn Emulator>) -> Result {
        info!("emulator {} registered", emu.name());
        self.emulators.register(emu)
    }

    pub fn emulator_unregister(&self, name: &str) -> Result {
        self.emulators.unregister(name)
    }

    pub fn emulator_find(&self, compatible: &str) -> Option<Arc<dyn Emulator>> {
        self.emulators.find(compatible)
    }

    pub fn emulator_count(&self) -> usize {
        self.emulators.list.read().len()
    }

    pub(crate) fn emu_probe(&self, guest: &Guest, cfg: &RegionConfig, compatible: &str) -> Result<Arc<EmuInstance>> {
        let emulator = self.emulators.find(compatible).ok_or_else(|| {
            warn!("{}: no emulator for {}", guest.name, compatible);
            Error::NotAvail
        })?;
        let info = EmuDeviceInfo {
            name: cfg.name.clone(),
            base: cfg.gpa,
            size: cfg.size,
            irq: cfg.irq,
        };
        let ctx = EmuContext::new(self, guest.id, None);
        let mut device = emulator.probe(&ctx, &info)?;
        device.reset(&ctx)?;
        debug!("{}: {} probed at {:#x}", guest.name, emulator.name(), cfg.gpa);
        Ok(Arc::new(EmuInstance {
            info,
            compatible: String::from(compatible),
            endian: emulator.endian(),
            emulator,
            device: SpinLock::new(device),
        }))
    }

    pub(crate) fn emu_reset(&self, guest: &Guest, inst: &EmuInstance) {
        let ctx = EmuContext::new(self, guest.id, None);
        if let Err(e) = inst.device.lock().reset(&ctx) {
            warn!("{}: reset of {} failed: {}", guest.name, inst.name(), e);
        }
    }

    pub(crate) fn emu_remove(&self, guest: &Guest, inst: &EmuInstance) {
        let ctx = EmuContext::new(self, guest.id, None);
        inst.device.lock().remove(&ctx);
    }

    /// Perform the trapped access on `inst` and complete the instruction
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn emulate_mmio(
        &self,
        guest: &Guest,
        vcpu: &Vcpu,
        inst: &EmuInstance,
        base: u64,
        gpa: u64,
        info: &MmioInfo,
        regs: &mut VcpuRegs,
    ) -> Result {
        if !matches!(info.size, 1 | 2 | 4 | 8) {
            return Err(Error::Invalid);
        }
        let offset = gpa - base;
        let mask = size_mask(info.size);
        let swap = inst.endian.is_big() != info.big_endian;
        let ctx = EmuContext::new(self, guest.id, Some(vcpu.id));

        if info.write {
            let mut val = regs.get_reg(info.reg) & mask;
            if swap {
                val = swap_bytes(val, info.size);
            }
            inst.device.lock().write(&ctx, offset, val, info.size, mask)?;
        } else {
            let mut val = inst.device.lock().read(&ctx, offset, info.size)? & mask;
            if swap {
                val = swap_bytes(val, info.size);
            }
            if info.sign_extend {
                val = sign_extend(val, info.size);
            }
            if !info.reg_64bit {
                val &= 0xFFFF_FFFF;
            }
            regs.set_reg(info.reg, val);
        }
        regs.advance_pc(info.insn_len);
        Ok(())
    }
}
