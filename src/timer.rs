//! One-shot timer events on top of the per-CPU clockchips.
//!
//! Every host CPU keeps its armed events sorted by expiry and programs its
//! clockchip for the earliest one. An event fires from the clockchip IRQ
//! once `timestamp() >= start + duration`, never earlier.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{trace, warn};

use crate::arena::define_id;
use crate::arch::traits::ClockChip;
use crate::clocksource::ns2cyc_ceil;
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use crate::sync::IrqSpinLock;
use crate::vcpu::VcpuId;

define_id!(
    /// Handle of a timer event
    TimerEventId
);

pub type TimerCallback = Arc<dyn Fn(&Hypervisor, TimerEventId) + Send + Sync>;

/// What happens when an event expires
#[derive(Clone)]
pub enum TimerAction {
    /// Time slice of the CPU's current VCPU is over
    SchedTick,
    /// A VCPU's bounded wait ran out
    WaitTimeout(VcpuId),
    /// Fold the clocksource into the timecounter before it wraps
    ClockRefresh,
    Callback(TimerCallback),
}

impl core::fmt::Debug for TimerAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TimerAction::SchedTick => f.write_str("SchedTick"),
            TimerAction::WaitTimeout(v) => write!(f, "WaitTimeout({:?})", v),
            TimerAction::ClockRefresh => f.write_str("ClockRefresh"),
            TimerAction::Callback(_) => f.write_str("Callback"),
        }
    }
}

pub struct TimerEvent {
    name: String,
    cpu: usize,
    action: TimerAction,
    duration_ns: u64,
    /// Absolute expiry while armed
    expiry: Option<u64>,
}

/// Per-CPU queue of armed events, earliest first
#[derive(Default)]
pub(crate) struct TimerCpu {
    queue: IrqSpinLock<Vec<(u64, TimerEventId)>>,
}

impl TimerCpu {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn insert(&self, expiry: u64, id: TimerEventId) -> bool {
        let mut q = self.queue.lock();
        let pos = q.partition_point(|&(e, _)| e <= expiry);
        q.insert(pos, (expiry, id));
        pos == 0
    }

    fn remove(&self, id: TimerEventId) {
        self.queue.lock().retain(|&(_, e)| e != id);
    }

    fn next_expiry(&self) -> Option<u64> {
        self.queue.lock().first().map(|&(e, _)| e)
    }

    fn pop_expired(&self, now: u64) -> Vec<(u64, TimerEventId)> {
        let mut q = self.queue.lock();
        let n = q.partition_point(|&(e, _)| e <= now);
        q.drain(..n).collect()
    }
}

impl Hypervisor {
    /// Monotonic host time in nanoseconds
    pub fn timestamp(&self) -> u64 {
        self.clock.timestamp()
    }

    pub fn timer_event_create(&self, name: &str, cpu: usize, action: TimerAction) -> Result<TimerEventId> {
        if cpu >= self.cpus.len() {
            return Err(Error::Invalid);
        }
        let raw = self.timers.lock().insert(TimerEvent {
            name: String::from(name),
            cpu,
            action,
            duration_ns: 0,
            expiry: None,
        });
        Ok(TimerEventId(raw))
    }

    /// Arm `id` to fire `duration_ns` from now; re-arms if already pending
    pub fn timer_event_start(&self, id: TimerEventId, duration_ns: u64) -> Result {
        let now = self.timestamp();
        let expiry = now.saturating_add(duration_ns);
        let cpu = {
            let mut events = self.timers.lock();
            let ev = events.get_mut(id.0).ok_or(Error::NotAvail)?;
            ev.duration_ns = duration_ns;
            ev.expiry = Some(expiry);
            ev.cpu
        };
        let tq = &self.cpus[cpu].timer;
        tq.remove(id);
        if tq.insert(expiry, id) {
            self.timer_program(cpu, now);
        }
        Ok(())
    }

    /// Arm again with the previous duration
    pub fn timer_event_restart(&self, id: TimerEventId) -> Result {
        let duration = self.timers.lock().get(id.0).ok_or(Error::NotAvail)?.duration_ns;
        self.timer_event_start(id, duration)
    }

    /// Fire at the next opportunity
    pub fn timer_event_expire(&self, id: TimerEventId) -> Result {
        self.timer_event_start(id, 0)
    }

    pub fn timer_event_stop(&self, id: TimerEventId) -> Result {
        let cpu = {
            let mut events = self.timers.lock();
            let ev = events.get_mut(id.0).ok_or(Error::NotAvail)?;
            ev.expiry = None;
            ev.cpu
        };
        self.cpus[cpu].timer.remove(id);
        Ok(())
    }

    pub fn timer_event_pending(&self, id: TimerEventId) -> bool {
        self.timers
            .lock()
            .get(id.0)
            .map(|ev| ev.expiry.is_some())
            .unwrap_or(false)
    }

    /// Absolute expiry of an armed event
    pub fn timer_event_expiry(&self, id: TimerEventId) -> Option<u64> {
        self.timers.lock().get(id.0).and_then(|ev| ev.expiry)
    }

    pub fn timer_event_name(&self, id: TimerEventId) -> Option<String> {
        self.timers.lock().get(id.0).map(|ev| ev.name.clone())
    }

    pub fn timer_event_destroy(&self, id: TimerEventId) -> Result {
        let ev = self.timers.lock().remove(id.0).ok_or(Error::NotAvail)?;
        self.cpus[ev.cpu].timer.remove(id);
        Ok(())
    }

    /// Clockchip interrupt of `cpu`: run every expired event, re-program
    pub(crate) fn timer_irq(&self, cpu: usize) {
        let now = self.timestamp();
        for (expiry, id) in self.cpus[cpu].timer.pop_expired(now) {
            let action = {
                let mut events = self.timers.lock();
                match events.get_mut(id.0) {
                    // Restarted or stopped since it was queued.
                    Some(ev) if ev.expiry == Some(expiry) => {
                        ev.expiry = None;
                        ev.action.clone()
                    }
                    _ => continue,
                }
            };
            trace!("cpu{}: timer event {:?} fired", cpu, action);
            self.timer_run_action(cpu, id, action);
        }
        self.timer_program(cpu, self.timestamp());
    }

    fn timer_run_action(&self, cpu: usize, id: TimerEventId, action: TimerAction) {
        match action {
            TimerAction::SchedTick => self.sched_tick(cpu),
            TimerAction::WaitTimeout(vcpu) => self.vcpu_wait_timeout(vcpu, id),
            TimerAction::ClockRefresh => {
                self.timestamp();
                if let Err(e) = self.timer_event_restart(id) {
                    warn!("clock refresh restart failed: {}", e);
                }
            }
            TimerAction::Callback(cb) => cb(self, id),
        }
    }

    fn timer_program(&self, cpu: usize, now: u64) {
        let Some(chip) = self.cpus[cpu].clockchip.as_ref() else {
            return;
        };
        match self.cpus[cpu].timer.next_expiry() {
            None => chip.shutdown(),
            Some(expiry) => {
                let delta = expiry
                    .saturating_sub(now)
                    .clamp(chip.min_delta_ns(), chip.max_delta_ns());
                program_chip(chip.as_ref(), delta);
            }
        }
    }
}

fn program_chip(chip: &dyn ClockChip, delta_ns: u64) {
    let cycles = ns2cyc_ceil(delta_ns, chip.mult(), chip.shift());
    if let Err(e) = chip.set_next_event(cycles) {
        warn!("{}: set_next_event({}) failed: {}", chip.name(), cycles, e);
    }
}
