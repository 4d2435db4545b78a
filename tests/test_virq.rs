//! Virtual interrupts: assertion, delivery, waiting for interrupts and
//! host IRQ routing

mod common;

use std::sync::{Arc, Mutex};
use std::thread;

use common::{config_with_cpus, Harness, MS};
use vmm_core::arch::VcpuContextOps;
use vmm_core::devices::EmuContext;
use vmm_core::guest::{Guest, GuestIrqEvent, GuestIrqHandler};
use vmm_core::waitqueue::WaitStatus;
use vmm_core::{Error, GuestConfig, GuestId, Hypervisor, VcpuConfig, VcpuId, VcpuState};

fn one_vcpu_guest(nr_cpus: usize) -> (Harness, VcpuId) {
    let mut config = config_with_cpus(nr_cpus);
    let mut guest = GuestConfig::new("vm");
    guest.vcpus.push(VcpuConfig::new("cpu0", 0x4008_0000));
    config.guests.push(guest);
    let mut h = Harness::new(config);
    let guest = h.hv.guest_find_by_name("vm").unwrap();
    h.start();
    h.hv.guest_kick(guest.id()).unwrap();
    h.service();
    let id = guest.vcpu_ids()[0];
    assert_eq!(h.hv.current_vcpu_id(0), Some(id));
    (h, id)
}

/// Guest on CPU 0 executes WFI
fn guest_wfi(h: &mut Harness) -> WaitStatus {
    h.regs[0].advance_pc(4);
    h.hv.handle_wfi(0, &mut h.regs[0]).expect("wfi")
}

#[test]
fn wfi_then_remote_assert() {
    let (mut h, id) = one_vcpu_guest(2);

    // Test 1: WFI with nothing pending parks the VCPU
    assert_eq!(guest_wfi(&mut h), WaitStatus::Blocked);
    assert_eq!(h.hv.vcpu_state(id), Ok(VcpuState::Paused));
    assert!(h.hv.vcpu_irq_waiting(id));
    assert_ne!(h.hv.current_vcpu_id(0), Some(id));

    // Test 2: another CPU asserts line 42 and wakes it
    let hv = Arc::clone(&h.hv);
    thread::spawn(move || hv.vcpu_irq_assert(id, 42, 0))
        .join()
        .unwrap()
        .unwrap();
    assert_eq!(h.hv.vcpu_state(id), Ok(VcpuState::Ready));
    assert_eq!(h.hv.vcpu_irq_next(id), Some((42, 0)));
    assert!(!h.hv.vcpu_irq_waiting(id));
    assert_eq!(h.hv.vcpu_take_wait_result(id), Some(Ok(())));

    // Test 3: back on the CPU, the line lands in a list register
    h.service();
    assert_eq!(h.hv.current_vcpu_id(0), Some(id));
    assert!(h.arch.live_state(0).lr_for(42).is_some());
    assert_eq!(h.hv.vcpu_irq_next(id), None);
    assert_eq!(h.hv.vcpu_stats(id).unwrap().irq_executed, 1);
}

#[test]
fn wfi_with_pending_line_returns_at_once() {
    let (mut h, id) = one_vcpu_guest(1);
    h.hv.vcpu_irq_assert(id, 77, 3).unwrap();

    assert_eq!(guest_wfi(&mut h), WaitStatus::Done);
    assert_eq!(h.hv.vcpu_state(id), Ok(VcpuState::Running));
    assert_eq!(h.hv.current_vcpu_id(0), Some(id));
}

#[test]
fn bounded_wait_times_out() {
    let (mut h, id) = one_vcpu_guest(1);

    assert_eq!(h.hv.vcpu_irq_wait(id, Some(5 * MS)), Ok(WaitStatus::Blocked));
    h.service();
    assert_eq!(h.hv.vcpu_state(id), Ok(VcpuState::Paused));

    // Test 1: not a nanosecond early
    h.advance(4 * MS);
    assert_eq!(h.hv.vcpu_state(id), Ok(VcpuState::Paused));

    // Test 2: timeout makes it runnable with the Timeout result
    h.advance(MS);
    assert_eq!(h.hv.current_vcpu_id(0), Some(id));
    assert_eq!(h.hv.vcpu_take_wait_result(id), Some(Err(Error::Timeout)));
    assert_eq!(h.hv.vcpu_take_wait_result(id), None);
}

#[test]
fn wait_resume_forces_wakeup() {
    let (mut h, id) = one_vcpu_guest(1);

    // Test 1: nobody waits yet
    assert_eq!(h.hv.vcpu_irq_wait_resume(id), Err(Error::NotAvail));

    guest_wfi(&mut h);
    h.hv.vcpu_irq_wait_resume(id).unwrap();
    assert_eq!(h.hv.vcpu_state(id), Ok(VcpuState::Ready));
    assert!(!h.hv.vcpu_irq_pending(id));

    // Test 2: only the VCPU itself, while running, may wait
    assert_eq!(h.hv.vcpu_irq_wait(id, None), Err(Error::Invalid));
}

#[test]
fn level_line_stays_pending_until_deasserted() {
    let (h, id) = one_vcpu_guest(1);
    h.hv.vcpu_irq_set_level(id, 9, true).unwrap();
    h.hv.vcpu_irq_assert(id, 9, 1).unwrap();

    h.hv.vcpu_irq_clear(id, 9).unwrap();
    assert!(h.hv.vcpu_irq_pending(id));
    assert_eq!(h.hv.vcpu_irq_next(id), Some((9, 1)));

    h.hv.vcpu_irq_deassert(id, 9).unwrap();
    h.hv.vcpu_irq_clear(id, 9).unwrap();
    assert!(!h.hv.vcpu_irq_pending(id));

    // Test 1: edge lines clear at once
    h.hv.vcpu_irq_assert(id, 10, 0).unwrap();
    h.hv.vcpu_irq_clear(id, 10).unwrap();
    assert!(!h.hv.vcpu_irq_pending(id));

    // Test 2: out-of-range lines are rejected
    assert_eq!(h.hv.vcpu_irq_assert(id, 4096, 0), Err(Error::Invalid));
}

#[test]
fn urgent_lines_are_delivered_first() {
    let (mut h, id) = one_vcpu_guest(1);
    h.hv.vcpu_irq_assert(id, 120, 0).unwrap();
    h.hv.vcpu_irq_assert(id, 33, 0).unwrap();
    assert_eq!(h.hv.vcpu_irq_next(id), Some((33, 0)));

    h.irq(0);
    let live = h.arch.live_state(0);
    assert!(live.lr_for(33).is_some());
    assert!(live.lr_for(120).is_some());

    // Test 1: completed and cleared, a line can fire again
    h.arch.complete_virq(0, 33);
    h.hv.vcpu_irq_clear(id, 33).unwrap();
    h.hv.vcpu_irq_assert(id, 33, 5).unwrap();
    assert_eq!(h.hv.vcpu_irq_next(id), Some((33, 5)));
    h.irq(0);
    assert_eq!(h.hv.vcpu_stats(id).unwrap().irq_executed, 3);
}

#[test]
fn routed_host_irq_reaches_guest() {
    const SPI: u32 = 40;
    let (mut h, id) = one_vcpu_guest(1);
    h.hv.host_irq_route(SPI, id, 42).unwrap();
    assert!(!h.irqc.is_masked(SPI));

    // Test 1: the line is masked until the guest EOIs it
    h.irqc.raise(0, SPI);
    h.irq(0);
    assert!(h.arch.live_state(0).lr_for(42).is_some());
    assert!(h.irqc.is_masked(SPI));
    assert_eq!(h.hv.host_irq_stat(SPI, 0), 1);
    assert!(h.irqc.eois().contains(&SPI));

    h.hv.host_irq_guest_eoi(SPI).unwrap();
    assert!(!h.irqc.is_masked(SPI));

    // Test 2: a routed IRQ wakes a VCPU waiting for interrupts
    h.arch.complete_virq(0, 42);
    h.hv.vcpu_irq_clear(id, 42).unwrap();
    guest_wfi(&mut h);
    assert_eq!(h.hv.vcpu_state(id), Ok(VcpuState::Paused));
    h.irqc.raise(0, SPI);
    h.irq(0);
    assert_eq!(h.hv.current_vcpu_id(0), Some(id));
    assert_eq!(h.hv.vcpu_take_wait_result(id), Some(Ok(())));

    // Test 3: a routed line takes no handlers
    let handler = Arc::new(|_: &vmm_core::Hypervisor, _: u32, _: usize, _: usize| {
        vmm_core::host_irq::IrqReturn::Handled
    });
    assert_eq!(h.hv.host_irq_register(SPI, "dup", handler, 0).err(), Some(Error::Busy));
    h.hv.host_irq_unroute(SPI).unwrap();
    assert!(h.irqc.is_masked(SPI));
}

type EventLog = Arc<Mutex<Vec<(&'static str, GuestIrqEvent)>>>;

fn recorder(log: &EventLog, tag: &'static str) -> GuestIrqHandler {
    let log = log.clone();
    Arc::new(move |_: &Hypervisor, _: &Guest, ev: &GuestIrqEvent| log.lock().unwrap().push((tag, *ev)))
}

fn line(irq: u32, cpu: Option<u32>, level: bool) -> GuestIrqEvent {
    GuestIrqEvent {
        irq,
        cpu,
        level,
        reason: 0,
    }
}

fn two_vcpu_guest() -> (Harness, GuestId, Vec<VcpuId>) {
    let mut config = config_with_cpus(1);
    let mut guest = GuestConfig::new("vm");
    guest.vcpus.push(VcpuConfig::new("cpu0", 0x4008_0000));
    guest.vcpus.push(VcpuConfig::new("cpu1", 0x4008_0000));
    guest.irq_count = 64;
    config.guests.push(guest);
    let mut h = Harness::new(config);
    let guest = h.hv.guest_find_by_name("vm").unwrap();
    h.start();
    h.hv.guest_kick(guest.id()).unwrap();
    (h, guest.id(), guest.vcpu_ids())
}

#[test]
fn unrouted_guest_line_reaches_target_vcpu() {
    let (h, gid, ids) = two_vcpu_guest();
    assert_eq!(h.hv.guest_irq_count(gid), 64);

    h.hv.guest_emulate_irq(gid, &line(33, Some(1), true)).unwrap();
    assert!(h.hv.vcpu_irq_pending(ids[1]));
    assert!(!h.hv.vcpu_irq_pending(ids[0]));
    h.hv.guest_emulate_irq(gid, &line(33, Some(1), false)).unwrap();
    assert!(!h.hv.vcpu_irq_pending(ids[1]));

    // Test 1: lines past the guest's count and missing VCPUs
    assert_eq!(h.hv.guest_emulate_irq(gid, &line(64, None, true)), Err(Error::Invalid));
    assert_eq!(h.hv.guest_emulate_irq(gid, &line(33, Some(2), true)), Err(Error::NotAvail));

    // Test 2: device context without a target uses the boot VCPU
    EmuContext::new(&h.hv, gid, None).irq_assert(41, 0).unwrap();
    assert!(h.hv.vcpu_irq_pending(ids[0]));
    assert!(!h.hv.vcpu_irq_pending(ids[1]));
    EmuContext::new(&h.hv, gid, None).irq_level(41, Some(1), true, 0).unwrap();
    assert!(h.hv.vcpu_irq_pending(ids[1]));
}

#[test]
fn guest_line_handlers_run_in_order() {
    let (h, gid, ids) = two_vcpu_guest();
    let log = EventLog::default();

    let gic = h.hv.guest_register_irq_handler(gid, 40, "gic", recorder(&log, "gic")).unwrap();
    let trace = h.hv.guest_register_irq_handler(gid, 40, "trace", recorder(&log, "trace")).unwrap();
    assert_eq!(
        h.hv.guest_register_irq_handler(gid, 40, "gic", recorder(&log, "again")).err(),
        Some(Error::Busy)
    );
    assert_eq!(
        h.hv.guest_register_irq_handler(gid, 64, "gic", recorder(&log, "gic")).err(),
        Some(Error::Invalid)
    );
    let guest = h.hv.guest_find(gid).unwrap();
    assert_eq!(guest.irq_handler_names(40), vec!["gic", "trace"]);

    // Test 1: the chain replaces direct delivery
    EmuContext::new(&h.hv, gid, None).irq_assert(40, 0).unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![("gic", line(40, None, true)), ("trace", line(40, None, true))]
    );
    assert!(!h.hv.vcpu_irq_pending(ids[0]));

    // Test 2: unregistering shrinks the chain, then restores direct delivery
    h.hv.guest_unregister_irq_handler(gid, 40, gic).unwrap();
    assert_eq!(h.hv.guest_unregister_irq_handler(gid, 40, gic), Err(Error::NotAvail));
    log.lock().unwrap().clear();
    h.hv.guest_emulate_irq(gid, &line(40, Some(1), false)).unwrap();
    assert_eq!(*log.lock().unwrap(), vec![("trace", line(40, Some(1), false))]);

    h.hv.guest_unregister_irq_handler(gid, 40, trace).unwrap();
    assert!(guest.irq_handler_names(40).is_empty());
    h.hv.guest_emulate_irq(gid, &line(40, None, true)).unwrap();
    assert!(h.hv.vcpu_irq_pending(ids[0]));
    assert_eq!(log.lock().unwrap().len(), 1);
}
