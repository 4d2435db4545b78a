//! Boot configuration
//!
//! Plain data parsed from the device tree by `dtb`, or built directly.

use alloc::string::String;
use alloc::vec::Vec;

use crate::guest::{RegionFlags, RegionType};
use crate::percpu::CpuMask;
use crate::vcpu::DEFAULT_PRIORITY;
use crate::vcpu_interrupt::DEFAULT_NR_VIRQS;

/// Host RAM bank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBank {
    pub base: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    pub name: String,
    pub gpa: u64,
    pub size: u64,
    pub kind: RegionType,
    /// Fixed host backing of RAM/ROM; allocated from the pool when absent
    pub host_phys: Option<u64>,
    /// Aliased guest address of ALIAS regions
    pub alias_phys: Option<u64>,
    /// Compatible string of EMULATED regions
    pub emulator: Option<String>,
    pub flags: RegionFlags,
    /// Required alignment of the host backing, 0 for page alignment
    pub align: u64,
    /// Virtual IRQ of an emulated device
    pub irq: Option<u32>,
}

impl RegionConfig {
    pub fn ram(name: &str, gpa: u64, size: u64) -> Self {
        Self {
            name: String::from(name),
            gpa,
            size,
            kind: RegionType::Ram,
            host_phys: None,
            alias_phys: None,
            emulator: None,
            flags: RegionFlags::RAM | RegionFlags::ALLOC,
            align: 0,
            irq: None,
        }
    }

    pub fn rom(name: &str, gpa: u64, size: u64) -> Self {
        Self {
            kind: RegionType::Rom,
            flags: RegionFlags::ROM | RegionFlags::ALLOC,
            ..Self::ram(name, gpa, size)
        }
    }

    pub fn alias(name: &str, gpa: u64, size: u64, target: u64) -> Self {
        Self {
            kind: RegionType::Alias,
            alias_phys: Some(target),
            flags: RegionFlags::RAM,
            ..Self::ram(name, gpa, size)
        }
    }

    pub fn emulated(name: &str, gpa: u64, size: u64, compatible: &str) -> Self {
        Self {
            kind: RegionType::Emulated,
            emulator: Some(String::from(compatible)),
            flags: RegionFlags::READ | RegionFlags::WRITE,
            ..Self::ram(name, gpa, size)
        }
    }

    pub fn reserved(name: &str, gpa: u64, size: u64) -> Self {
        Self {
            kind: RegionType::Reserved,
            flags: RegionFlags::empty(),
            ..Self::ram(name, gpa, size)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcpuConfig {
    pub name: String,
    pub start_pc: u64,
    pub priority: u8,
    /// 0 selects the scheduler default
    pub time_slice_ns: u64,
    pub affinity: Option<CpuMask>,
    /// Stays in RESET when the guest is kicked
    pub poweroff: bool,
}

impl VcpuConfig {
    pub fn new(name: &str, start_pc: u64) -> Self {
        Self {
            name: String::from(name),
            start_pc,
            priority: DEFAULT_PRIORITY,
            time_slice_ns: 0,
            affinity: None,
            poweroff: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    pub name: String,
    pub big_endian: bool,
    pub vcpus: Vec<VcpuConfig>,
    pub regions: Vec<RegionConfig>,
    /// Emulated IRQ lines devices may raise
    pub irq_count: u32,
}

impl GuestConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            big_endian: false,
            vcpus: Vec::new(),
            regions: Vec::new(),
            irq_count: DEFAULT_NR_VIRQS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmmConfig {
    /// Root `compatible` of the board
    pub compatible: Vec<String>,
    pub mterm_priority: u8,
    /// Default time slice, 0 for the built-in default
    pub sched_tick_ns: u64,
    pub log_level: Option<log::LevelFilter>,
    pub memory: Vec<MemoryBank>,
    /// Host CPU ids from `/cpus`
    pub cpus: Vec<u64>,
    pub bootargs: String,
    pub guests: Vec<GuestConfig>,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            compatible: alloc::vec![String::from(crate::board::QEMU_VIRT_COMPATIBLE)],
            mterm_priority: DEFAULT_PRIORITY,
            sched_tick_ns: 0,
            log_level: None,
            memory: Vec::new(),
            cpus: alloc::vec![0],
            bootargs: String::new(),
            guests: Vec::new(),
        }
    }
}
