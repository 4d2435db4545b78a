//! Shared harness for the end-to-end tests
//!
//! Time only moves when a test calls `advance`. Each step fires whatever
//! clockchip deadline has passed through the software IRQ chip and runs
//! every CPU through its IRQ entry point, as the hardware would.

#![allow(dead_code)]

pub mod fdt;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use vmm_core::arch::traits::{
    ClockChip, ClockSource, FirmwareCall, GuestException, HostIrqChip, Stage2Root, TlbScope,
    VcpuArch, VcpuContextOps, VcpuInit, VcpuKind,
};
use vmm_core::arch::{HostedAarch64, VcpuArchState, VcpuRegs};
use vmm_core::mm::HostRamPool;
use vmm_core::percpu::CpuMask;
use vmm_core::{Hypervisor, Platform, Result, VmmConfig};

pub const MS: u64 = 1_000_000;
/// EL2 physical timer PPI
pub const TIMER_IRQ: u32 = 26;
pub const NR_HOST_IRQS: u32 = 128;

/// Clocksource counting nanoseconds directly
pub struct SimClock {
    now: AtomicU64,
}

impl SimClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { now: AtomicU64::new(0) })
    }

    pub fn advance(&self, ns: u64) {
        self.now.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl ClockSource for SimClock {
    fn name(&self) -> &str {
        "sim"
    }

    fn rating(&self) -> u32 {
        300
    }

    fn read(&self) -> u64 {
        self.now()
    }

    fn mask(&self) -> u64 {
        u64::MAX
    }

    fn mult(&self) -> u32 {
        1
    }

    fn shift(&self) -> u32 {
        0
    }
}

/// Clockchip that remembers its deadline
pub struct RecordingChip {
    clock: Arc<SimClock>,
    deadline: AtomicU64,
    programmed: AtomicU64,
}

impl RecordingChip {
    pub fn new(clock: Arc<SimClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            deadline: AtomicU64::new(u64::MAX),
            programmed: AtomicU64::new(0),
        })
    }

    pub fn deadline(&self) -> Option<u64> {
        match self.deadline.load(Ordering::SeqCst) {
            u64::MAX => None,
            d => Some(d),
        }
    }

    /// Deadline reached; the chip stops until re-programmed
    pub fn take_due(&self) -> bool {
        let d = self.deadline.load(Ordering::SeqCst);
        if d != u64::MAX && self.clock.now() >= d {
            self.deadline.store(u64::MAX, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn programmed(&self) -> u64 {
        self.programmed.load(Ordering::SeqCst)
    }
}

impl ClockChip for RecordingChip {
    fn name(&self) -> &str {
        "recording"
    }

    fn hirq(&self) -> u32 {
        TIMER_IRQ
    }

    fn mult(&self) -> u32 {
        1
    }

    fn shift(&self) -> u32 {
        0
    }

    fn min_delta_ns(&self) -> u64 {
        1_000
    }

    fn max_delta_ns(&self) -> u64 {
        1 << 40
    }

    fn set_next_event(&self, cycles: u64) -> Result {
        self.deadline.store(self.clock.now() + cycles, Ordering::SeqCst);
        self.programmed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.deadline.store(u64::MAX, Ordering::SeqCst);
    }
}

/// Interrupt controller driven by the test
pub struct SoftIrqChip {
    pending: Vec<Mutex<BTreeSet<u32>>>,
    masked: Mutex<BTreeSet<u32>>,
    eoi_log: Mutex<Vec<u32>>,
    ipi_log: Mutex<Vec<(u32, CpuMask)>>,
}

impl SoftIrqChip {
    pub fn new(nr_cpus: usize) -> Arc<Self> {
        Arc::new(Self {
            pending: (0..nr_cpus).map(|_| Mutex::new(BTreeSet::new())).collect(),
            masked: Mutex::new((0..NR_HOST_IRQS).collect()),
            eoi_log: Mutex::new(Vec::new()),
            ipi_log: Mutex::new(Vec::new()),
        })
    }

    pub fn raise(&self, cpu: usize, irq: u32) {
        self.pending[cpu].lock().unwrap().insert(irq);
    }

    pub fn is_masked(&self, irq: u32) -> bool {
        self.masked.lock().unwrap().contains(&irq)
    }

    pub fn eois(&self) -> Vec<u32> {
        self.eoi_log.lock().unwrap().clone()
    }

    pub fn ipis(&self) -> Vec<(u32, CpuMask)> {
        self.ipi_log.lock().unwrap().clone()
    }
}

impl HostIrqChip for SoftIrqChip {
    fn name(&self) -> &str {
        "soft-irq"
    }

    fn irq_count(&self) -> u32 {
        NR_HOST_IRQS
    }

    fn active_irq(&self, cpu: usize) -> Option<u32> {
        let masked = self.masked.lock().unwrap();
        let mut pending = self.pending[cpu].lock().unwrap();
        let irq = pending.iter().copied().find(|i| !masked.contains(i))?;
        pending.remove(&irq);
        Some(irq)
    }

    fn mask(&self, irq: u32) {
        self.masked.lock().unwrap().insert(irq);
    }

    fn unmask(&self, irq: u32) {
        self.masked.lock().unwrap().remove(&irq);
    }

    fn eoi(&self, irq: u32) {
        self.eoi_log.lock().unwrap().push(irq);
    }

    fn set_affinity(&self, _irq: u32, _cpus: CpuMask) -> Result {
        Ok(())
    }

    fn raise_ipi(&self, irq: u32, cpus: CpuMask) -> Result {
        self.ipi_log.lock().unwrap().push((irq, cpus));
        for cpu in cpus.iter() {
            if cpu < self.pending.len() {
                self.raise(cpu, irq);
            }
        }
        Ok(())
    }
}

/// Host RAM for the frame pool: leaked, 2 MiB aligned, identity "mapped"
pub fn leak_ram(size: u64) -> HostRamPool {
    const ALIGN: usize = 2 << 20;
    let buf: &'static mut [u8] = Box::leak(vec![0u8; size as usize + ALIGN].into_boxed_slice());
    let start = buf.as_mut_ptr() as usize;
    let base = (start + ALIGN - 1) & !(ALIGN - 1);
    HostRamPool {
        phys_base: base as u64,
        size,
        virt_base: base,
    }
}

/// Hosted backend whose orphan resets start failing after `orphan_inits`
pub struct FlakyArch {
    inner: HostedAarch64,
    orphan_inits: AtomicU64,
}

impl FlakyArch {
    pub fn new(nr_cpus: usize, orphan_inits: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: HostedAarch64::new(nr_cpus),
            orphan_inits: AtomicU64::new(orphan_inits),
        })
    }
}

impl VcpuArch for FlakyArch {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn vcpu_init(&self, init: &VcpuInit, regs: &mut VcpuRegs, state: &mut VcpuArchState) -> Result {
        if init.kind == VcpuKind::Orphan {
            let left = self.orphan_inits.load(Ordering::SeqCst);
            if left == 0 {
                return Err(vmm_core::Error::NoMem);
            }
            self.orphan_inits.store(left - 1, Ordering::SeqCst);
        }
        self.inner.vcpu_init(init, regs, state)
    }

    fn save_private(&self, cpu: usize, state: &mut VcpuArchState) {
        self.inner.save_private(cpu, state)
    }

    fn restore_private(&self, cpu: usize, state: &VcpuArchState) {
        self.inner.restore_private(cpu, state)
    }

    fn switch_stage2(&self, cpu: usize, root: Option<Stage2Root>) {
        self.inner.switch_stage2(cpu, root)
    }

    fn tlb_invalidate(&self, cpu: usize, scope: TlbScope) {
        self.inner.tlb_invalidate(cpu, scope)
    }

    fn irq_priority(&self, irq: u32) -> u32 {
        self.inner.irq_priority(irq)
    }

    fn irq_execute(&self, cpu: usize, regs: &mut VcpuRegs, irq: u32, reason: u32) -> Result {
        self.inner.irq_execute(cpu, regs, irq, reason)
    }

    fn irq_withdraw(&self, cpu: usize, irq: u32) {
        self.inner.irq_withdraw(cpu, irq)
    }

    fn inject_exception(&self, cpu: usize, regs: &mut VcpuRegs, exc: &GuestException) -> Result {
        self.inner.inject_exception(cpu, regs, exc)
    }

    fn guest_big_endian(&self, cpu: usize, regs: &VcpuRegs) -> bool {
        self.inner.guest_big_endian(cpu, regs)
    }

    fn wait_for_interrupt(&self, cpu: usize) {
        self.inner.wait_for_interrupt(cpu)
    }

    fn kick_cpu(&self, cpu: usize) {
        self.inner.kick_cpu(cpu)
    }

    fn firmware_call(&self, call: FirmwareCall) -> Result {
        self.inner.firmware_call(call)
    }
}

/// Platform around an arbitrary backend, without a host IRQ chip
pub fn bare_platform(arch: Arc<dyn VcpuArch>, nr_cpus: usize) -> Platform {
    let clock = SimClock::new();
    Platform {
        arch,
        irq_chip: None,
        clocksource: clock.clone(),
        clockchips: (0..nr_cpus)
            .map(|_| RecordingChip::new(clock.clone()) as Arc<dyn ClockChip>)
            .collect(),
        ram: leak_ram(8 << 20),
    }
}

pub struct Harness {
    pub hv: Arc<Hypervisor>,
    pub arch: Arc<HostedAarch64>,
    pub clock: Arc<SimClock>,
    pub irqc: Arc<SoftIrqChip>,
    pub chips: Vec<Arc<RecordingChip>>,
    pub regs: Vec<VcpuRegs>,
}

impl Harness {
    pub fn try_new(config: VmmConfig) -> Result<Self> {
        let nr_cpus = config.cpus.len().max(1);
        let arch = Arc::new(HostedAarch64::new(nr_cpus));
        let clock = SimClock::new();
        let irqc = SoftIrqChip::new(nr_cpus);
        let chips: Vec<_> = (0..nr_cpus).map(|_| RecordingChip::new(clock.clone())).collect();
        let platform = Platform {
            arch: arch.clone(),
            irq_chip: Some(irqc.clone()),
            clocksource: clock.clone(),
            clockchips: chips.iter().map(|c| c.clone() as Arc<dyn ClockChip>).collect(),
            ram: leak_ram(64 << 20),
        };
        let hv = Arc::new(Hypervisor::new(config, platform)?);
        Ok(Self {
            hv,
            arch,
            clock,
            irqc,
            chips,
            regs: vec![VcpuRegs::default(); nr_cpus],
        })
    }

    pub fn new(config: VmmConfig) -> Self {
        Self::try_new(config).expect("hypervisor construction")
    }

    pub fn with_cpus(n: usize) -> Self {
        Self::new(config_with_cpus(n))
    }

    /// Bring every CPU into the scheduler
    pub fn start(&mut self) {
        for cpu in 0..self.regs.len() {
            self.hv.start_cpu(cpu, &mut self.regs[cpu]).expect("start_cpu");
        }
    }

    /// One pass of IRQ entry on `cpu`
    pub fn irq(&mut self, cpu: usize) {
        self.hv.handle_irq(cpu, &mut self.regs[cpu]);
    }

    /// Move time forward in 1 ms steps, servicing every CPU after each
    pub fn advance(&mut self, ns: u64) {
        let mut left = ns;
        while left > 0 {
            let step = left.min(MS);
            self.clock.advance(step);
            left -= step;
            self.service();
        }
    }

    /// Deliver due timer interrupts and run every CPU's IRQ exit
    pub fn service(&mut self) {
        for cpu in 0..self.regs.len() {
            if self.chips[cpu].take_due() {
                self.irqc.raise(cpu, TIMER_IRQ);
            }
            self.irq(cpu);
        }
    }

    pub fn yield_cpu(&mut self, cpu: usize) {
        self.hv.yield_current(cpu, &mut self.regs[cpu]);
    }

    /// Guest code on `cpu` writes `pattern` into every general register
    pub fn scribble(&mut self, cpu: usize, pattern: u64) {
        for n in 0..31u8 {
            self.regs[cpu].set_reg(n, pattern);
        }
    }
}

pub fn config_with_cpus(n: usize) -> VmmConfig {
    VmmConfig {
        cpus: (0..n as u64).collect(),
        ..VmmConfig::default()
    }
}
