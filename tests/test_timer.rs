//! Timer events driven by the clockchip interrupt

mod common;

use std::sync::{Arc, Mutex};

use common::{Harness, MS};
use vmm_core::timer::{TimerAction, TimerEventId};
use vmm_core::{Error, Hypervisor};

type Fired = Arc<Mutex<Vec<(TimerEventId, u64)>>>;

fn callback(fired: &Fired) -> TimerAction {
    let fired = fired.clone();
    TimerAction::Callback(Arc::new(move |hv: &Hypervisor, id: TimerEventId| {
        fired.lock().unwrap().push((id, hv.timestamp()));
    }))
}

fn started(nr_cpus: usize) -> Harness {
    let mut h = Harness::with_cpus(nr_cpus);
    h.start();
    h
}

#[test]
fn event_never_fires_early() {
    let mut h = started(1);
    let fired = Fired::default();
    let ev = h.hv.timer_event_create("oneshot", 0, callback(&fired)).unwrap();
    assert_eq!(h.hv.timer_event_name(ev).as_deref(), Some("oneshot"));

    h.hv.timer_event_start(ev, 3 * MS + MS / 2).unwrap();
    assert!(h.hv.timer_event_pending(ev));
    assert_eq!(h.hv.timer_event_expiry(ev), Some(3 * MS + MS / 2));
    assert_eq!(h.chips[0].deadline(), Some(3 * MS + MS / 2));

    h.advance(3 * MS);
    assert!(fired.lock().unwrap().is_empty());

    h.advance(MS);
    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].0, ev);
    assert!(fired[0].1 >= 3 * MS + MS / 2);
    assert!(!h.hv.timer_event_pending(ev));
    assert_eq!(h.hv.timer_event_expiry(ev), None);
}

#[test]
fn earliest_event_programs_chip() {
    let mut h = started(1);
    let fired = Fired::default();
    let late = h.hv.timer_event_create("late", 0, callback(&fired)).unwrap();
    let early = h.hv.timer_event_create("early", 0, callback(&fired)).unwrap();

    h.hv.timer_event_start(late, 8 * MS).unwrap();
    assert_eq!(h.chips[0].deadline(), Some(8 * MS));
    h.hv.timer_event_start(early, 2 * MS).unwrap();
    assert_eq!(h.chips[0].deadline(), Some(2 * MS));

    // Test 1: after the early one fires the chip moves to the late one
    h.advance(2 * MS);
    assert_eq!(fired.lock().unwrap().len(), 1);
    assert_eq!(h.chips[0].deadline(), Some(8 * MS));

    // Test 2: with nothing armed the chip is shut down
    h.advance(6 * MS);
    let ids: Vec<_> = fired.lock().unwrap().iter().map(|f| f.0).collect();
    assert_eq!(ids, vec![early, late]);
    assert_eq!(h.chips[0].deadline(), None);
}

#[test]
fn stop_restart_and_expire() {
    let mut h = started(1);
    let fired = Fired::default();
    let ev = h.hv.timer_event_create("ev", 0, callback(&fired)).unwrap();

    // Test 1: a stopped event stays quiet
    h.hv.timer_event_start(ev, 5 * MS).unwrap();
    h.hv.timer_event_stop(ev).unwrap();
    assert!(!h.hv.timer_event_pending(ev));
    h.advance(10 * MS);
    assert!(fired.lock().unwrap().is_empty());

    // Test 2: restart reuses the last duration from now
    h.hv.timer_event_restart(ev).unwrap();
    assert_eq!(h.hv.timer_event_expiry(ev), Some(15 * MS));
    h.advance(4 * MS);
    assert!(fired.lock().unwrap().is_empty());
    h.advance(MS);
    assert_eq!(fired.lock().unwrap().len(), 1);

    // Test 3: re-arming replaces the pending expiry
    h.hv.timer_event_start(ev, MS).unwrap();
    h.hv.timer_event_start(ev, 3 * MS).unwrap();
    h.advance(2 * MS);
    assert_eq!(fired.lock().unwrap().len(), 1);
    h.advance(MS);
    assert_eq!(fired.lock().unwrap().len(), 2);

    // Test 4: expire fires at the next clockchip interrupt
    h.hv.timer_event_expire(ev).unwrap();
    h.advance(MS);
    assert_eq!(fired.lock().unwrap().len(), 3);
}

#[test]
fn events_belong_to_their_cpu() {
    let mut h = started(2);
    let fired = Fired::default();
    let ev = h.hv.timer_event_create("cpu1", 1, callback(&fired)).unwrap();
    h.hv.timer_event_start(ev, 2 * MS).unwrap();
    assert_eq!(h.chips[1].deadline(), Some(2 * MS));
    assert_eq!(h.chips[0].deadline(), None);

    h.advance(2 * MS);
    assert_eq!(fired.lock().unwrap().len(), 1);
    assert_eq!(h.hv.host_irq_stat(common::TIMER_IRQ, 1), 1);
    assert_eq!(h.hv.host_irq_stat(common::TIMER_IRQ, 0), 0);

    // Test 1: a CPU that does not exist is refused
    assert_eq!(h.hv.timer_event_create("bad", 2, callback(&fired)), Err(Error::Invalid));
}

#[test]
fn destroyed_event_is_gone() {
    let mut h = started(1);
    let fired = Fired::default();
    let ev = h.hv.timer_event_create("tmp", 0, callback(&fired)).unwrap();
    h.hv.timer_event_start(ev, MS).unwrap();
    h.hv.timer_event_destroy(ev).unwrap();

    h.advance(2 * MS);
    assert!(fired.lock().unwrap().is_empty());
    assert_eq!(h.hv.timer_event_name(ev), None);
    assert_eq!(h.hv.timer_event_start(ev, MS), Err(Error::NotAvail));
    assert_eq!(h.hv.timer_event_destroy(ev), Err(Error::NotAvail));

    // Test 1: the slot is reused under a new generation
    let again = h.hv.timer_event_create("again", 0, callback(&fired)).unwrap();
    assert_ne!(again, ev);
    assert_eq!(h.hv.timer_event_stop(ev), Err(Error::NotAvail));
}
