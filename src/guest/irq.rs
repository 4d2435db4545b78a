//! Emulated interrupt lines of a guest
//!
//! Device emulators raise guest IRQ lines by number. Each line carries a
//! chain of handlers, normally installed by an emulated interrupt
//! controller, which run in registration order. A line with no handler
//! goes straight to the VCPU the event targets (the boot VCPU when none).

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace};
use spin::Mutex;

use super::{Guest, GuestId};
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;

/// One level change on a guest IRQ line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestIrqEvent {
    pub irq: u32,
    /// Target VCPU (by subid) when the source names one
    pub cpu: Option<u32>,
    pub level: bool,
    /// Architecture-specific reason passed on to the VCPU
    pub reason: u32,
}

pub type GuestIrqHandler = Arc<dyn Fn(&Hypervisor, &Guest, &GuestIrqEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrqHandlerId(u64);

static NEXT_HANDLER: AtomicU64 = AtomicU64::new(1);

struct Entry {
    id: IrqHandlerId,
    name: String,
    handler: GuestIrqHandler,
}

pub(crate) struct GuestIrqLines {
    count: u32,
    chains: Mutex<BTreeMap<u32, Vec<Entry>>>,
}

impl GuestIrqLines {
    pub(crate) fn new(count: u32) -> Self {
        Self {
            count,
            chains: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    fn register(&self, irq: u32, name: &str, handler: GuestIrqHandler) -> Result<IrqHandlerId> {
        if irq >= self.count {
            return Err(Error::Invalid);
        }
        let mut chains = self.chains.lock();
        let chain = chains.entry(irq).or_default();
        if chain.iter().any(|e| e.name == name) {
            return Err(Error::Busy);
        }
        let id = IrqHandlerId(NEXT_HANDLER.fetch_add(1, Ordering::Relaxed));
        chain.push(Entry {
            id,
            name: String::from(name),
            handler,
        });
        Ok(id)
    }

    fn unregister(&self, irq: u32, id: IrqHandlerId) -> Result {
        let mut chains = self.chains.lock();
        let chain = chains.get_mut(&irq).ok_or(Error::NotAvail)?;
        let pos = chain.iter().position(|e| e.id == id).ok_or(Error::NotAvail)?;
        chain.remove(pos);
        if chain.is_empty() {
            chains.remove(&irq);
        }
        Ok(())
    }

    /// Snapshot of the chain of `irq`, so handlers run unlocked
    fn handlers(&self, irq: u32) -> Vec<GuestIrqHandler> {
        self.chains
            .lock()
            .get(&irq)
            .map(|c| c.iter().map(|e| e.handler.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn handler_names(&self, irq: u32) -> Vec<String> {
        self.chains
            .lock()
            .get(&irq)
            .map(|c| c.iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default()
    }
}

impl Hypervisor {
    /// Append `handler` to the chain of guest line `irq`
    pub fn guest_register_irq_handler(
        &self,
        gid: GuestId,
        irq: u32,
        name: &str,
        handler: GuestIrqHandler,
    ) -> Result<IrqHandlerId> {
        let guest = self.guest_get(gid)?;
        let id = guest.irqs.register(irq, name, handler)?;
        debug!("{}: irq {} handler {}", guest.name, irq, name);
        Ok(id)
    }

    pub fn guest_unregister_irq_handler(&self, gid: GuestId, irq: u32, id: IrqHandlerId) -> Result {
        let guest = self.guest_get(gid)?;
        guest.irqs.unregister(irq, id)
    }

    /// Number of emulated IRQ lines of the guest; 0 for an unknown guest
    pub fn guest_irq_count(&self, gid: GuestId) -> u32 {
        self.guest_find(gid).map_or(0, |g| g.irqs.count())
    }

    /// Drive a guest IRQ line through its handler chain
    pub fn guest_emulate_irq(&self, gid: GuestId, event: &GuestIrqEvent) -> Result {
        let guest = self.guest_get(gid)?;
        if event.irq >= guest.irqs.count() {
            return Err(Error::Invalid);
        }
        let handlers = guest.irqs.handlers(event.irq);
        trace!("{}: irq {} level {} ({} handlers)", guest.name, event.irq, event.level, handlers.len());
        if handlers.is_empty() {
            return self.guest_irq_direct(&guest, event);
        }
        for h in handlers {
            h(self, &guest, event);
        }
        Ok(())
    }

    fn guest_irq_direct(&self, guest: &Guest, event: &GuestIrqEvent) -> Result {
        let subid = event.cpu.unwrap_or(0) as usize;
        let vcpu = guest.vcpus.read().get(subid).copied().ok_or(Error::NotAvail)?;
        if event.level {
            self.vcpu_irq_assert(vcpu, event.irq, event.reason)
        } else {
            self.vcpu_irq_deassert(vcpu, event.irq)
        }
    }
}
