//! Host interrupt descriptors, handler chains and IPIs

mod common;

use std::sync::{Arc, Mutex};

use common::{leak_ram, Harness, RecordingChip, SimClock, TIMER_IRQ};
use vmm_core::arch::traits::{ClockChip, IrqTrigger};
use vmm_core::arch::HostedAarch64;
use vmm_core::host_irq::{IrqFlags, IrqHandler, IrqReturn};
use vmm_core::percpu::CpuMask;
use vmm_core::{Error, Hypervisor, Platform, VmmConfig};

type Calls = Arc<Mutex<Vec<(u32, usize, usize)>>>;

fn recorder(calls: &Calls, ret: IrqReturn) -> IrqHandler {
    let calls = calls.clone();
    Arc::new(move |_: &Hypervisor, irq: u32, cpu: usize, opaque: usize| {
        calls.lock().unwrap().push((irq, cpu, opaque));
        ret
    })
}

#[test]
fn handler_chain_runs_in_order() {
    const IRQ: u32 = 50;
    let mut h = Harness::with_cpus(1);
    h.start();
    let calls = Calls::default();

    assert!(h.irqc.is_masked(IRQ));
    let first = h.hv.host_irq_register(IRQ, "first", recorder(&calls, IrqReturn::None), 1).unwrap();
    assert!(!h.irqc.is_masked(IRQ));
    let second = h.hv.host_irq_register(IRQ, "second", recorder(&calls, IrqReturn::Handled), 2).unwrap();
    assert_eq!(h.hv.host_irq_handler_names(IRQ), vec!["first", "second"]);

    // Test 1: every handler of the chain sees the interrupt once
    h.irqc.raise(0, IRQ);
    h.irq(0);
    assert_eq!(*calls.lock().unwrap(), vec![(IRQ, 0, 1), (IRQ, 0, 2)]);
    assert_eq!(h.hv.host_irq_stat(IRQ, 0), 1);
    assert!(h.irqc.eois().contains(&IRQ));

    // Test 2: the line masks again with its last handler
    h.hv.host_irq_unregister(IRQ, first).unwrap();
    assert!(h.hv.host_irq_is_enabled(IRQ));
    h.hv.host_irq_unregister(IRQ, second).unwrap();
    assert!(h.irqc.is_masked(IRQ));
    assert!(!h.hv.host_irq_is_enabled(IRQ));
    assert_eq!(h.hv.host_irq_unregister(IRQ, second), Err(Error::NotAvail));
    assert!(h.hv.host_irq_handler_names(IRQ).is_empty());
}

#[test]
fn disable_nests() {
    const IRQ: u32 = 51;
    let mut h = Harness::with_cpus(1);
    h.start();
    let calls = Calls::default();
    h.hv.host_irq_register(IRQ, "dev", recorder(&calls, IrqReturn::Handled), 0).unwrap();

    h.hv.host_irq_disable(IRQ).unwrap();
    h.hv.host_irq_disable(IRQ).unwrap();
    assert!(h.irqc.is_masked(IRQ));

    // Test 1: a masked line is not delivered
    h.irqc.raise(0, IRQ);
    h.irq(0);
    assert!(calls.lock().unwrap().is_empty());

    h.hv.host_irq_enable(IRQ).unwrap();
    assert!(!h.hv.host_irq_is_enabled(IRQ));
    h.hv.host_irq_enable(IRQ).unwrap();
    assert!(h.hv.host_irq_is_enabled(IRQ));

    // Test 2: once unmasked, the latched interrupt comes through
    h.irq(0);
    assert_eq!(calls.lock().unwrap().len(), 1);

    // Test 3: extra enables are harmless
    h.hv.host_irq_enable(IRQ).unwrap();
    assert!(h.hv.host_irq_is_enabled(IRQ));
}

#[test]
fn descriptor_attributes() {
    let h = Harness::with_cpus(2);

    // Test 1: the clockchip line is banked per CPU and has a handler
    let flags = h.hv.host_irq_flags(TIMER_IRQ).unwrap();
    assert!(flags.contains(IrqFlags::PER_CPU));
    assert_eq!(h.hv.host_irq_handler_names(TIMER_IRQ), vec!["clockchip"]);
    assert_eq!(h.hv.host_irq_set_affinity(TIMER_IRQ, CpuMask::single(1)), Err(Error::Invalid));
    assert_eq!(h.hv.host_irq_set_affinity(60, CpuMask::single(1)), Ok(()));

    // Test 2: trigger type follows set_type
    assert_eq!(h.hv.host_irq_trigger(60), Ok(IrqTrigger::LevelHigh));
    h.hv.host_irq_set_type(60, IrqTrigger::EdgeRising).unwrap();
    assert_eq!(h.hv.host_irq_trigger(60), Ok(IrqTrigger::EdgeRising));
    assert!(!h.hv.host_irq_flags(60).unwrap().contains(IrqFlags::LEVEL));
    h.hv.host_irq_set_type(60, IrqTrigger::LevelLow).unwrap();
    assert!(h.hv.host_irq_flags(60).unwrap().contains(IrqFlags::LEVEL));

    // Test 3: out-of-range lines and a second chip are refused
    assert_eq!(h.hv.host_irq_count(), common::NR_HOST_IRQS);
    assert_eq!(h.hv.host_irq_chip_name(), Some("soft-irq"));
    assert_eq!(h.hv.host_irq_disable(500), Err(Error::InvalidIrq));
    assert_eq!(h.hv.host_irq_stat(500, 0), 0);
    assert_eq!(h.hv.host_irq_register_chip(h.irqc.clone()), Err(Error::Busy));
}

#[test]
fn ipi_reaches_every_target() {
    const SGI: u32 = 1;
    let mut h = Harness::with_cpus(2);
    h.start();
    let calls = Calls::default();
    h.hv.host_irq_mark_per_cpu(SGI).unwrap();
    h.hv.host_irq_register(SGI, "ipi", recorder(&calls, IrqReturn::Handled), 0).unwrap();

    let mut both = CpuMask::single(0);
    both.set(1);
    h.hv.host_irq_raise_ipi(SGI, both).unwrap();
    assert_eq!(h.irqc.ipis(), vec![(SGI, both)]);

    h.service();
    assert_eq!(h.hv.host_irq_stat(SGI, 0), 1);
    assert_eq!(h.hv.host_irq_stat(SGI, 1), 1);
    let mut cpus: Vec<usize> = calls.lock().unwrap().iter().map(|c| c.1).collect();
    cpus.sort_unstable();
    assert_eq!(cpus, vec![0, 1]);
}

#[test]
fn no_chip_means_no_host_irqs() {
    let clock = SimClock::new();
    let chip: Arc<dyn ClockChip> = RecordingChip::new(clock.clone());
    let platform = Platform {
        arch: Arc::new(HostedAarch64::new(1)),
        irq_chip: None,
        clocksource: clock,
        clockchips: vec![chip],
        ram: leak_ram(8 << 20),
    };
    let hv = Hypervisor::new(VmmConfig::default(), platform).unwrap();

    assert_eq!(hv.host_irq_count(), 0);
    assert_eq!(hv.host_irq_chip_name(), None);
    let calls = Calls::default();
    assert_eq!(
        hv.host_irq_register(32, "dev", recorder(&calls, IrqReturn::Handled), 0).err(),
        Some(Error::NoChip)
    );
    assert_eq!(hv.host_irq_handle_active(0), Err(Error::NoChip));
}
