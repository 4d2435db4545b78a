//! ARM Generic Interrupt Controller (GICv2) host driver
//!
//! GIC Architecture:
//! - GICD (Distributor): interrupt enable, priority, trigger and routing
//! - GICC (CPU Interface): per-CPU acknowledge and EOI, banked by hardware
//!
//! Interrupt Types:
//! - SGI (0-15): Software Generated Interrupts
//! - PPI (16-31): Private Peripheral Interrupts (per-CPU, includes timers)
//! - SPI (32-1019): Shared Peripheral Interrupts

use core::ptr::{read_volatile, write_volatile};

use log::info;

use crate::arch::aarch64::defs::{GIC_SPURIOUS_INTID, IRQ_DEFAULT_PRIORITY};
use crate::arch::traits::{HostIrqChip, IrqTrigger};
use crate::error::{Error, Result};
use crate::percpu::CpuMask;

/// GICD Register offsets
const GICD_CTLR: usize = 0x000;
const GICD_TYPER: usize = 0x004;
const GICD_ISENABLER: usize = 0x100;
const GICD_ICENABLER: usize = 0x180;
const GICD_ICPENDR: usize = 0x280;
const GICD_IPRIORITYR: usize = 0x400;
const GICD_ITARGETSR: usize = 0x800;
const GICD_ICFGR: usize = 0xC00;
const GICD_SGIR: usize = 0xF00;

/// GICC Register offsets
const GICC_CTLR: usize = 0x000;
const GICC_PMR: usize = 0x004;
const GICC_IAR: usize = 0x00C;
const GICC_EOIR: usize = 0x010;

const GICC_IAR_INTID_MASK: u32 = 0x3FF;
/// INTIDs 1020-1023 are special (spurious)
const GICC_INTID_SPECIAL: u32 = 1020;

/// Number of SGIs, which cannot be reconfigured
const NR_SGIS: u32 = 16;
/// First SPI; below that interrupts are banked per CPU
const FIRST_SPI: u32 = 32;

/// GICv2 distributor plus the banked CPU interface
pub struct Gic {
    dist_base: usize,
    cpu_base: usize,
    nr_irqs: u32,
}

impl Gic {
    /// # Safety
    ///
    /// `dist_base` and `cpu_base` must be mapped GICD and GICC register
    /// frames that stay valid for the lifetime of the driver.
    pub unsafe fn new(dist_base: usize, cpu_base: usize) -> Self {
        let mut gic = Self {
            dist_base,
            cpu_base,
            nr_irqs: 0,
        };
        let typer = gic.dist_read(GICD_TYPER);
        gic.nr_irqs = (((typer & 0x1F) + 1) * 32).min(GIC_SPURIOUS_INTID + 1 - 4);
        gic
    }

    fn dist_read(&self, offset: usize) -> u32 {
        unsafe { read_volatile((self.dist_base + offset) as *const u32) }
    }

    fn dist_write(&self, offset: usize, value: u32) {
        unsafe { write_volatile((self.dist_base + offset) as *mut u32, value) }
    }

    fn dist_write_byte(&self, offset: usize, value: u8) {
        unsafe { write_volatile((self.dist_base + offset) as *mut u8, value) }
    }

    fn cpu_read(&self, offset: usize) -> u32 {
        unsafe { read_volatile((self.cpu_base + offset) as *const u32) }
    }

    fn cpu_write(&self, offset: usize, value: u32) {
        unsafe { write_volatile((self.cpu_base + offset) as *mut u32, value) }
    }

    /// Initialize the distributor (boot CPU only)
    pub fn init_distributor(&self) {
        self.dist_write(GICD_CTLR, 0);

        let words = (self.nr_irqs / 32) as usize;
        for i in 0..words {
            self.dist_write(GICD_ICENABLER + i * 4, 0xFFFF_FFFF);
            self.dist_write(GICD_ICPENDR + i * 4, 0xFFFF_FFFF);
        }
        for irq in 0..self.nr_irqs as usize {
            self.dist_write_byte(GICD_IPRIORITYR + irq, IRQ_DEFAULT_PRIORITY);
        }
        // SPIs default to CPU0
        for irq in FIRST_SPI as usize..self.nr_irqs as usize {
            self.dist_write_byte(GICD_ITARGETSR + irq, 1);
        }

        self.dist_write(GICD_CTLR, 1);
        info!("GICv2: {} interrupt lines", self.nr_irqs);
    }

    /// Initialize this CPU's interface
    pub fn init_cpu_interface(&self) {
        self.cpu_write(GICC_PMR, 0xFF);
        self.cpu_write(GICC_CTLR, 1);
    }

    fn check(&self, irq: u32) -> Result {
        if irq < self.nr_irqs {
            Ok(())
        } else {
            Err(Error::InvalidIrq)
        }
    }
}

impl HostIrqChip for Gic {
    fn name(&self) -> &str {
        "gicv2"
    }

    fn irq_count(&self) -> u32 {
        self.nr_irqs
    }

    fn active_irq(&self, _cpu: usize) -> Option<u32> {
        let intid = self.cpu_read(GICC_IAR) & GICC_IAR_INTID_MASK;
        (intid < GICC_INTID_SPECIAL).then_some(intid)
    }

    fn mask(&self, irq: u32) {
        self.dist_write(GICD_ICENABLER + (irq / 32) as usize * 4, 1 << (irq % 32));
    }

    fn unmask(&self, irq: u32) {
        self.dist_write(GICD_ISENABLER + (irq / 32) as usize * 4, 1 << (irq % 32));
    }

    fn eoi(&self, irq: u32) {
        self.cpu_write(GICC_EOIR, irq);
    }

    fn set_type(&self, irq: u32, trigger: IrqTrigger) -> Result {
        self.check(irq)?;
        if irq < NR_SGIS {
            return Err(Error::Invalid);
        }
        let edge = match trigger {
            IrqTrigger::LevelHigh => false,
            IrqTrigger::EdgeRising => true,
            // GICv2 only knows active-high level and rising edge.
            IrqTrigger::LevelLow | IrqTrigger::EdgeFalling => return Err(Error::Unsupp),
        };
        let reg = GICD_ICFGR + (irq / 16) as usize * 4;
        let bit = 1 << ((irq % 16) * 2 + 1);
        let cfg = self.dist_read(reg);
        self.dist_write(reg, if edge { cfg | bit } else { cfg & !bit });
        Ok(())
    }

    fn set_affinity(&self, irq: u32, cpus: CpuMask) -> Result {
        self.check(irq)?;
        if irq < FIRST_SPI {
            return Err(Error::Invalid);
        }
        let targets = (cpus.0 & 0xFF) as u8;
        if targets == 0 {
            return Err(Error::Invalid);
        }
        self.dist_write_byte(GICD_ITARGETSR + irq as usize, targets);
        Ok(())
    }

    fn raise_ipi(&self, irq: u32, cpus: CpuMask) -> Result {
        if irq >= NR_SGIS {
            return Err(Error::InvalidIrq);
        }
        self.dist_write(GICD_SGIR, (((cpus.0 & 0xFF) as u32) << 16) | irq);
        Ok(())
    }
}
