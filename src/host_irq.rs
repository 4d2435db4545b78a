//! Host interrupt layer
//!
//! One host IRQ chip registers at boot. Every line it handles gets a
//! descriptor with a handler chain, or a route that turns the line into a
//! virtual IRQ of a VCPU. A routed line stays masked from delivery until
//! the guest signals end-of-interrupt through `host_irq_guest_eoi`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::{debug, info, warn};
use spin::{Mutex, Once};

use crate::arch::traits::{HostIrqChip, IrqTrigger};
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use crate::percpu::CpuMask;
use crate::sync::IrqSpinLock;
use crate::vcpu::VcpuId;

/// What a handler did with the interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    None,
    Handled,
}

/// `(hypervisor, irq, cpu, opaque)`
pub type IrqHandler = Arc<dyn Fn(&Hypervisor, u32, usize, usize) -> IrqReturn + Send + Sync>;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IrqFlags: u32 {
        /// Banked per host CPU (SGI/PPI)
        const PER_CPU = 1 << 0;
        const ROUTED = 1 << 1;
        const LEVEL = 1 << 2;
    }
}

/// Handle of a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrqActionId(u64);

struct IrqAction {
    id: IrqActionId,
    name: String,
    handler: IrqHandler,
    opaque: usize,
}

struct IrqDesc {
    flags: IrqFlags,
    actions: Vec<IrqAction>,
    route: Option<(VcpuId, u32)>,
    /// Masked while non-zero
    disable_depth: u32,
    trigger: IrqTrigger,
    counts: Vec<u64>,
}

struct ChipSlot {
    chip: Arc<dyn HostIrqChip>,
    descs: Vec<IrqSpinLock<IrqDesc>>,
}

pub(crate) struct HostIrqs {
    slot: Once<ChipSlot>,
    next_action: AtomicU64,
    /// Serializes registration paths
    reg: Mutex<()>,
}

impl HostIrqs {
    pub(crate) fn new() -> Self {
        Self {
            slot: Once::new(),
            next_action: AtomicU64::new(1),
            reg: Mutex::new(()),
        }
    }

    fn slot(&self) -> Result<&ChipSlot> {
        self.slot.get().ok_or(Error::NoChip)
    }

    fn desc(&self, irq: u32) -> Result<(&dyn HostIrqChip, &IrqSpinLock<IrqDesc>)> {
        let slot = self.slot()?;
        let desc = slot.descs.get(irq as usize).ok_or(Error::InvalidIrq)?;
        Ok((slot.chip.as_ref(), desc))
    }
}

impl Hypervisor {
    /// Install the host interrupt controller. Only one chip is supported.
    pub fn host_irq_register_chip(&self, chip: Arc<dyn HostIrqChip>) -> Result {
        let _reg = self.irqs.reg.lock();
        if self.irqs.slot.get().is_some() {
            return Err(Error::Busy);
        }
        let nr_cpus = self.cpus.len();
        let count = chip.irq_count();
        info!("host irq chip {} with {} lines", chip.name(), count);
        let descs = (0..count)
            .map(|_| {
                IrqSpinLock::new(IrqDesc {
                    flags: IrqFlags::empty(),
                    actions: Vec::new(),
                    route: None,
                    disable_depth: 1,
                    trigger: IrqTrigger::LevelHigh,
                    counts: vec![0; nr_cpus],
                })
            })
            .collect();
        self.irqs.slot.call_once(|| ChipSlot { chip, descs });
        Ok(())
    }

    pub fn host_irq_chip_name(&self) -> Option<&str> {
        self.irqs.slot.get().map(|s| s.chip.name())
    }

    /// Number of lines, 0 without a chip
    pub fn host_irq_count(&self) -> u32 {
        self.irqs.slot.get().map_or(0, |s| s.descs.len() as u32)
    }

    /// Append a handler to `irq`'s chain; the first handler unmasks the line
    pub fn host_irq_register(
        &self,
        irq: u32,
        name: &str,
        handler: IrqHandler,
        opaque: usize,
    ) -> Result<IrqActionId> {
        let _reg = self.irqs.reg.lock();
        let (chip, desc) = self.irqs.desc(irq)?;
        let mut d = desc.lock();
        if d.route.is_some() {
            return Err(Error::Busy);
        }
        let id = IrqActionId(self.irqs.next_action.fetch_add(1, Ordering::Relaxed));
        d.actions.push(IrqAction {
            id,
            name: String::from(name),
            handler,
            opaque,
        });
        if d.actions.len() == 1 && d.disable_depth > 0 {
            d.disable_depth -= 1;
            if d.disable_depth == 0 {
                chip.unmask(irq);
            }
        }
        debug!("irq {}: handler {} registered", irq, name);
        Ok(id)
    }

    pub fn host_irq_unregister(&self, irq: u32, action: IrqActionId) -> Result {
        let _reg = self.irqs.reg.lock();
        let (chip, desc) = self.irqs.desc(irq)?;
        let mut d = desc.lock();
        let pos = d.actions.iter().position(|a| a.id == action).ok_or(Error::NotAvail)?;
        d.actions.remove(pos);
        if d.actions.is_empty() {
            if d.disable_depth == 0 {
                chip.mask(irq);
            }
            d.disable_depth += 1;
        }
        Ok(())
    }

    /// Undo one `host_irq_disable`
    pub fn host_irq_enable(&self, irq: u32) -> Result {
        let (chip, desc) = self.irqs.desc(irq)?;
        let mut d = desc.lock();
        match d.disable_depth {
            0 => {}
            1 => {
                d.disable_depth = 0;
                chip.unmask(irq);
            }
            _ => d.disable_depth -= 1,
        }
        Ok(())
    }

    /// Mask `irq`; nests with `host_irq_enable`
    pub fn host_irq_disable(&self, irq: u32) -> Result {
        let (chip, desc) = self.irqs.desc(irq)?;
        let mut d = desc.lock();
        if d.disable_depth == 0 {
            chip.mask(irq);
        }
        d.disable_depth += 1;
        Ok(())
    }

    pub fn host_irq_is_enabled(&self, irq: u32) -> bool {
        self.irqs
            .desc(irq)
            .map(|(_, d)| d.lock().disable_depth == 0)
            .unwrap_or(false)
    }

    pub fn host_irq_set_type(&self, irq: u32, trigger: IrqTrigger) -> Result {
        let (chip, desc) = self.irqs.desc(irq)?;
        let mut d = desc.lock();
        chip.set_type(irq, trigger)?;
        d.trigger = trigger;
        d.flags.set(IrqFlags::LEVEL, trigger.is_level());
        Ok(())
    }

    pub fn host_irq_set_affinity(&self, irq: u32, cpus: CpuMask) -> Result {
        let (chip, desc) = self.irqs.desc(irq)?;
        let d = desc.lock();
        if d.flags.contains(IrqFlags::PER_CPU) {
            return Err(Error::Invalid);
        }
        chip.set_affinity(irq, cpus)
    }

    /// Mark `irq` as banked per CPU
    pub fn host_irq_mark_per_cpu(&self, irq: u32) -> Result {
        let (_, desc) = self.irqs.desc(irq)?;
        desc.lock().flags.insert(IrqFlags::PER_CPU);
        Ok(())
    }

    pub fn host_irq_flags(&self, irq: u32) -> Result<IrqFlags> {
        let (_, desc) = self.irqs.desc(irq)?;
        let flags = desc.lock().flags;
        Ok(flags)
    }

    pub fn host_irq_trigger(&self, irq: u32) -> Result<IrqTrigger> {
        let (_, desc) = self.irqs.desc(irq)?;
        let trigger = desc.lock().trigger;
        Ok(trigger)
    }

    /// Times `irq` was taken on `cpu`
    pub fn host_irq_stat(&self, irq: u32, cpu: usize) -> u64 {
        self.irqs
            .desc(irq)
            .ok()
            .and_then(|(_, d)| d.lock().counts.get(cpu).copied())
            .unwrap_or(0)
    }

    /// Names of the handlers registered on `irq`
    pub fn host_irq_handler_names(&self, irq: u32) -> Vec<String> {
        self.irqs
            .desc(irq)
            .map(|(_, d)| d.lock().actions.iter().map(|a| a.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Deliver `irq` to `vcpu` as virtual IRQ `virq`
    pub fn host_irq_route(&self, irq: u32, vcpu: VcpuId, virq: u32) -> Result {
        let _reg = self.irqs.reg.lock();
        let (chip, desc) = self.irqs.desc(irq)?;
        self.vcpu_get(vcpu)?;
        let mut d = desc.lock();
        if d.route.is_some() || !d.actions.is_empty() {
            return Err(Error::Busy);
        }
        d.route = Some((vcpu, virq));
        d.flags.insert(IrqFlags::ROUTED);
        d.disable_depth = 0;
        chip.unmask(irq);
        debug!("irq {} routed to {:?} virq {}", irq, vcpu, virq);
        Ok(())
    }

    pub fn host_irq_unroute(&self, irq: u32) -> Result {
        let _reg = self.irqs.reg.lock();
        let (chip, desc) = self.irqs.desc(irq)?;
        let mut d = desc.lock();
        if d.route.take().is_none() {
            return Err(Error::NotAvail);
        }
        d.flags.remove(IrqFlags::ROUTED);
        d.disable_depth = 1;
        chip.mask(irq);
        Ok(())
    }

    /// The guest finished with a routed interrupt; let the line fire again
    pub fn host_irq_guest_eoi(&self, irq: u32) -> Result {
        let (chip, desc) = self.irqs.desc(irq)?;
        let d = desc.lock();
        if d.route.is_none() {
            return Err(Error::Invalid);
        }
        chip.unmask(irq);
        Ok(())
    }

    pub fn host_irq_raise_ipi(&self, irq: u32, cpus: CpuMask) -> Result {
        let (chip, _) = self.irqs.desc(irq)?;
        chip.raise_ipi(irq, cpus)
    }

    /// Service the chip's active interrupt on `cpu`.
    ///
    /// Returns false when nothing was pending.
    pub fn host_irq_handle_active(&self, cpu: usize) -> Result<bool> {
        let slot = self.irqs.slot()?;
        let chip = slot.chip.as_ref();
        let Some(irq) = chip.active_irq(cpu) else {
            return Ok(false);
        };
        let Some(desc) = slot.descs.get(irq as usize) else {
            warn!("cpu{}: active irq {} out of range", cpu, irq);
            return Err(Error::InvalidIrq);
        };
        chip.ack(irq);

        let (route, actions) = {
            let mut d = desc.lock();
            if let Some(c) = d.counts.get_mut(cpu) {
                *c += 1;
            }
            let actions: Vec<(IrqHandler, usize)> =
                d.actions.iter().map(|a| (a.handler.clone(), a.opaque)).collect();
            (d.route, actions)
        };

        if let Some((vcpu, virq)) = route {
            chip.mask(irq);
            chip.eoi(irq);
            if let Err(e) = self.vcpu_irq_assert(vcpu, virq, irq) {
                warn!("irq {}: route to {:?} failed: {}", irq, vcpu, e);
            }
            return Ok(true);
        }

        let mut handled = false;
        for (handler, opaque) in actions {
            handled |= handler(self, irq, cpu, opaque) == IrqReturn::Handled;
        }
        if !handled {
            debug!("cpu{}: irq {} not handled", cpu, irq);
        }
        chip.eoi(irq);
        Ok(true)
    }
}
