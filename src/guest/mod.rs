//! Guests: a VCPU set sharing one region map and one stage-2 table

pub mod aspace;
pub mod irq;
pub mod region;

pub use aspace::{AspaceEvent, AspaceNotifier, FaultOutcome, NotifierId};
pub use irq::{GuestIrqEvent, GuestIrqHandler, IrqHandlerId};
pub use region::{Region, RegionFlags, RegionKind, RegionMap, RegionType};

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use crate::arch::traits::Stage2Root;
use crate::arena::define_id;
use crate::devices::MmioInfo;
use crate::mm::Stage2Table;
use crate::vcpu::VcpuId;
use irq::GuestIrqLines;

define_id!(
    /// Handle of a guest
    GuestId
);

/// Kind of access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Exec,
}

/// Second-stage fault as reported by the trap decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage2Fault {
    pub gpa: u64,
    /// Guest virtual address of the access (FAR)
    pub gva: u64,
    pub access: AccessKind,
    /// Access size in bytes, 0 when unknown
    pub size: u8,
    pub is_unpriv: bool,
    /// Decoded load/store, when the syndrome or instruction allowed it
    pub mmio: Option<MmioInfo>,
}

pub struct Guest {
    pub(crate) id: GuestId,
    pub(crate) name: String,
    pub(crate) big_endian: bool,
    pub(crate) vcpus: RwLock<Vec<VcpuId>>,
    pub(crate) regions: RwLock<RegionMap>,
    /// Bumped on every region map change
    pub(crate) generation: AtomicU64,
    /// Taken on destroy
    pub(crate) stage2: Mutex<Option<Stage2Table>>,
    pub(crate) root: Stage2Root,
    pub(crate) notifiers: Mutex<Vec<(NotifierId, AspaceNotifier)>>,
    pub(crate) reset_count: AtomicU64,
    pub(crate) irqs: GuestIrqLines,
}

impl Guest {
    pub(crate) fn new(id: GuestId, name: &str, big_endian: bool, irq_count: u32, stage2: Stage2Table) -> Self {
        let root = stage2.root();
        Self {
            id,
            name: String::from(name),
            big_endian,
            vcpus: RwLock::new(Vec::new()),
            regions: RwLock::new(RegionMap::new()),
            generation: AtomicU64::new(0),
            stage2: Mutex::new(Some(stage2)),
            root,
            notifiers: Mutex::new(Vec::new()),
            reset_count: AtomicU64::new(0),
            irqs: GuestIrqLines::new(irq_count),
        }
    }

    pub fn id(&self) -> GuestId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// VCPUs in creation order
    pub fn vcpu_ids(&self) -> Vec<VcpuId> {
        self.vcpus.read().clone()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.read().len()
    }

    pub fn stage2_root(&self) -> Stage2Root {
        self.root
    }

    pub fn vmid(&self) -> u16 {
        self.root.vmid
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    /// Copy of the region covering `gpa`
    pub fn find_region(&self, gpa: u64) -> Option<Region> {
        self.regions.read().find(gpa).cloned()
    }

    pub fn regions(&self) -> Vec<Region> {
        self.regions.read().iter().cloned().collect()
    }

    /// Handlers on emulated line `irq`, in the order they run
    pub fn irq_handler_names(&self, irq: u32) -> Vec<String> {
        self.irqs.handler_names(irq)
    }

    pub fn reset_count(&self) -> u64 {
        self.reset_count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Guest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guest")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("vmid", &self.root.vmid)
            .finish()
    }
}
