//! Virtual interrupts of a VCPU
//!
//! Emulators and routed host IRQs assert lines; the scheduler executes the
//! most urgent deliverable one into the guest right before it resumes.
//! A line stays pending from `assert` until `clear`, and once executed it
//! is not delivered again until cleared.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::{trace, warn};

use crate::arch::traits::VcpuArch;
use crate::arch::VcpuRegs;
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use crate::timer::{TimerAction, TimerEventId};
use crate::vcpu::{Vcpu, VcpuId, VcpuState, WaitKind, WaitSlot};
use crate::waitqueue::WaitStatus;

/// Default number of virtual interrupt lines per VCPU
pub const DEFAULT_NR_VIRQS: u32 = 1024;

const BITS: usize = 64;

fn words(nr: u32) -> usize {
    (nr as usize).div_ceil(BITS)
}

fn test_bit(map: &[u64], n: u32) -> bool {
    map[n as usize / BITS] & (1 << (n as usize % BITS)) != 0
}

fn set_bit(map: &mut [u64], n: u32) {
    map[n as usize / BITS] |= 1 << (n as usize % BITS);
}

fn clear_bit(map: &mut [u64], n: u32) {
    map[n as usize / BITS] &= !(1 << (n as usize % BITS));
}

fn for_each_bit(map: &[u64], mut f: impl FnMut(u32)) {
    for (w, &word) in map.iter().enumerate() {
        let mut bits = word;
        while bits != 0 {
            let b = bits.trailing_zeros();
            f((w * BITS) as u32 + b);
            bits &= bits - 1;
        }
    }
}

/// Interrupt line bookkeeping
pub struct VirqState {
    nr: u32,
    asserted: Vec<u64>,
    executed: Vec<u64>,
    /// Lines configured as level-triggered
    level: Vec<u64>,
    /// Current input level of level-triggered lines
    line: Vec<u64>,
    reason: Vec<u32>,
}

impl VirqState {
    pub fn new(nr: u32) -> Self {
        let n = words(nr);
        Self {
            nr,
            asserted: vec![0; n],
            executed: vec![0; n],
            level: vec![0; n],
            line: vec![0; n],
            reason: vec![0; nr as usize],
        }
    }

    pub fn nr_irqs(&self) -> u32 {
        self.nr
    }

    fn check(&self, irq: u32) -> Result {
        if irq < self.nr {
            Ok(())
        } else {
            Err(Error::Invalid)
        }
    }

    pub fn set_level(&mut self, irq: u32, level: bool) -> Result {
        self.check(irq)?;
        if level {
            set_bit(&mut self.level, irq);
        } else {
            clear_bit(&mut self.level, irq);
            clear_bit(&mut self.line, irq);
        }
        Ok(())
    }

    /// Returns true when the line was not already pending
    pub fn assert(&mut self, irq: u32, reason: u32) -> Result<bool> {
        self.check(irq)?;
        if test_bit(&self.level, irq) {
            set_bit(&mut self.line, irq);
        }
        if test_bit(&self.asserted, irq) {
            return Ok(false);
        }
        set_bit(&mut self.asserted, irq);
        self.reason[irq as usize] = reason;
        Ok(true)
    }

    pub fn deassert(&mut self, irq: u32) -> Result {
        self.check(irq)?;
        clear_bit(&mut self.line, irq);
        clear_bit(&mut self.asserted, irq);
        Ok(())
    }

    /// Acknowledge: drop the line and its reason. A level line that is
    /// still high becomes pending again.
    pub fn clear(&mut self, irq: u32) -> Result {
        self.check(irq)?;
        clear_bit(&mut self.asserted, irq);
        clear_bit(&mut self.executed, irq);
        if test_bit(&self.level, irq) && test_bit(&self.line, irq) {
            set_bit(&mut self.asserted, irq);
        } else {
            self.reason[irq as usize] = 0;
        }
        Ok(())
    }

    pub fn is_asserted(&self, irq: u32) -> bool {
        irq < self.nr && test_bit(&self.asserted, irq)
    }

    pub fn is_executed(&self, irq: u32) -> bool {
        irq < self.nr && test_bit(&self.executed, irq)
    }

    pub fn pending(&self) -> bool {
        self.asserted.iter().any(|&w| w != 0)
    }

    /// Most urgent asserted line not yet executed; ties go to the lower number
    pub fn next(&self, arch: &dyn VcpuArch) -> Option<(u32, u32)> {
        let mut best: Option<(u32, u32)> = None;
        for (w, (&a, &e)) in self.asserted.iter().zip(self.executed.iter()).enumerate() {
            let mut bits = a & !e;
            while bits != 0 {
                let irq = (w * BITS) as u32 + bits.trailing_zeros();
                bits &= bits - 1;
                let prio = arch.irq_priority(irq);
                if best.map_or(true, |(_, p)| prio > p) {
                    best = Some((irq, prio));
                }
            }
        }
        best.map(|(irq, _)| (irq, self.reason[irq as usize]))
    }

    fn mark_executed(&mut self, irq: u32) {
        set_bit(&mut self.executed, irq);
    }

    /// Executed lines whose source went away before the guest took them
    fn take_withdrawn(&mut self) -> Vec<u32> {
        let mut out = Vec::new();
        for w in 0..self.executed.len() {
            let gone = self.executed[w] & !self.asserted[w];
            if gone != 0 {
                for_each_bit(&[gone], |b| out.push((w * BITS) as u32 + b));
                self.executed[w] &= !gone;
            }
        }
        out
    }

    pub fn reset(&mut self) {
        for map in [&mut self.asserted, &mut self.executed, &mut self.line] {
            map.iter_mut().for_each(|w| *w = 0);
        }
        self.reason.iter_mut().for_each(|r| *r = 0);
    }
}

impl Hypervisor {
    /// Raise `irq` on `vcpu`. Wakes the VCPU if it waits for interrupts.
    pub fn vcpu_irq_assert(&self, id: VcpuId, irq: u32, reason: u32) -> Result {
        let vcpu = self.vcpu_get(id)?;
        let mut virq = vcpu.virq.lock();
        let newly = virq.assert(irq, reason)?;
        if newly {
            trace!("{}: virq {} asserted (reason {:#x})", vcpu.name, irq, reason);
        }
        let mut slot = vcpu.wait.lock();
        if slot.kind == WaitKind::Irq {
            self.wake_waiter(&vcpu, &mut slot, Ok(()));
        }
        drop(slot);
        let sched = vcpu.sched.lock();
        if sched.state == VcpuState::Running {
            if let Some(cpu) = sched.on_cpu {
                self.arch.kick_cpu(cpu);
            }
        }
        Ok(())
    }

    pub fn vcpu_irq_deassert(&self, id: VcpuId, irq: u32) -> Result {
        let vcpu = self.vcpu_get(id)?;
        let result = vcpu.virq.lock().deassert(irq);
        result
    }

    pub fn vcpu_irq_clear(&self, id: VcpuId, irq: u32) -> Result {
        let vcpu = self.vcpu_get(id)?;
        let result = vcpu.virq.lock().clear(irq);
        result
    }

    /// Configure `irq` as level (true) or edge (false) triggered
    pub fn vcpu_irq_set_level(&self, id: VcpuId, irq: u32, level: bool) -> Result {
        let vcpu = self.vcpu_get(id)?;
        let result = vcpu.virq.lock().set_level(irq, level);
        result
    }

    pub fn vcpu_irq_pending(&self, id: VcpuId) -> bool {
        self.vcpu_get(id)
            .map(|v| v.virq.lock().pending())
            .unwrap_or(false)
    }

    pub fn vcpu_irq_next(&self, id: VcpuId) -> Option<(u32, u32)> {
        let vcpu = self.vcpu_get(id).ok()?;
        let next = vcpu.virq.lock().next(self.arch.as_ref());
        next
    }

    /// Block the VCPU until an interrupt is asserted or the wait is resumed.
    ///
    /// Must be called by the VCPU itself while it is RUNNING. With a
    /// timeout the wait ends with `Timeout` after `timeout_ns`.
    pub fn vcpu_irq_wait(&self, id: VcpuId, timeout_ns: Option<u64>) -> Result<WaitStatus> {
        let vcpu = self.vcpu_get(id)?;
        let virq = vcpu.virq.lock();
        let mut slot = vcpu.wait.lock();
        if virq.pending() {
            slot.result = Some(Ok(()));
            return Ok(WaitStatus::Done);
        }
        self.block_on(&vcpu, &mut slot, WaitKind::Irq, timeout_ns)?;
        Ok(WaitStatus::Blocked)
    }

    /// Force a waiting VCPU out of `vcpu_irq_wait`
    pub fn vcpu_irq_wait_resume(&self, id: VcpuId) -> Result {
        let vcpu = self.vcpu_get(id)?;
        let _virq = vcpu.virq.lock();
        let mut slot = vcpu.wait.lock();
        if slot.kind != WaitKind::Irq {
            return Err(Error::NotAvail);
        }
        self.wake_waiter(&vcpu, &mut slot, Ok(()));
        Ok(())
    }

    /// Whether the VCPU is currently blocked in `vcpu_irq_wait`
    pub fn vcpu_irq_waiting(&self, id: VcpuId) -> bool {
        self.vcpu_get(id)
            .map(|v| v.wait.lock().kind == WaitKind::Irq)
            .unwrap_or(false)
    }

    /// Outcome of the last finished wait, consumed by the read
    pub fn vcpu_take_wait_result(&self, id: VcpuId) -> Option<Result> {
        let vcpu = self.vcpu_get(id).ok()?;
        let result = vcpu.wait.lock().result.take();
        result
    }

    /// Pause the VCPU with its wait slot held; the caller reschedules
    pub(crate) fn block_on(
        &self,
        vcpu: &Arc<Vcpu>,
        slot: &mut WaitSlot,
        kind: WaitKind,
        timeout_ns: Option<u64>,
    ) -> Result {
        let cpu = {
            let sched = vcpu.sched.lock();
            if sched.state != VcpuState::Running {
                return Err(Error::Invalid);
            }
            sched.host_cpu
        };
        slot.kind = kind;
        slot.result = None;
        if let Some(ns) = timeout_ns {
            let ev = self.timer_event_create(&vcpu.name, cpu, TimerAction::WaitTimeout(vcpu.id))?;
            slot.timer = Some(ev);
            self.timer_event_start(ev, ns)?;
        }
        if let Err(e) = self.state_change(vcpu, VcpuState::Paused) {
            slot.kind = WaitKind::None;
            if let Some(ev) = slot.timer.take() {
                let _ = self.timer_event_destroy(ev);
            }
            return Err(e);
        }
        Ok(())
    }

    /// End a wait with `result` and make the VCPU runnable again
    pub(crate) fn wake_waiter(&self, vcpu: &Vcpu, slot: &mut WaitSlot, result: Result) {
        slot.kind = WaitKind::None;
        slot.result = Some(result);
        if let Some(ev) = slot.timer.take() {
            let _ = self.timer_event_destroy(ev);
        }
        if let Err(e) = self.state_change(vcpu, VcpuState::Ready) {
            trace!("{}: wake skipped ({})", vcpu.name, e);
        }
    }

    /// Timer action of a bounded wait
    pub(crate) fn vcpu_wait_timeout(&self, id: VcpuId, ev: TimerEventId) {
        let Ok(vcpu) = self.vcpu_get(id) else {
            return;
        };
        let mut slot = vcpu.wait.lock();
        // A wake elsewhere may have ended this wait and started another
        let Some(result) = slot.timeout_result(ev) else {
            return;
        };
        trace!("{}: wait timed out", vcpu.name);
        self.wake_waiter(&vcpu, &mut slot, result);
    }

    /// Execute deliverable interrupts of the VCPU running on `cpu`
    pub(crate) fn vcpu_irq_process(&self, cpu: usize, vcpu: &Vcpu, regs: &mut VcpuRegs) {
        let arch = self.arch.as_ref();
        let mut virq = vcpu.virq.lock();
        for irq in virq.take_withdrawn() {
            arch.irq_withdraw(cpu, irq);
        }
        let mut executed = 0;
        while let Some((irq, reason)) = virq.next(arch) {
            match arch.irq_execute(cpu, regs, irq, reason) {
                Ok(()) => {
                    virq.mark_executed(irq);
                    executed += 1;
                }
                Err(Error::Busy) => break,
                Err(e) => {
                    warn!("{}: virq {} execute failed: {}", vcpu.name, irq, e);
                    break;
                }
            }
        }
        if executed > 0 {
            vcpu.sched.lock().stats.irq_executed += executed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::HostedAarch64;

    #[test]
    fn assert_is_idempotent() {
        let mut s = VirqState::new(64);
        assert_eq!(s.assert(5, 1), Ok(true));
        assert_eq!(s.assert(5, 2), Ok(false));
        assert!(s.pending());
        s.clear(5).unwrap();
        assert!(!s.pending());
        assert_eq!(s.assert(64, 0), Err(Error::Invalid));
    }

    #[test]
    fn deassert_of_idle_line_is_noop() {
        let mut s = VirqState::new(32);
        s.deassert(3).unwrap();
        assert!(!s.pending());
    }

    #[test]
    fn next_prefers_arch_priority_then_lower_number() {
        let arch = HostedAarch64::new(1);
        let mut s = VirqState::new(128);
        s.assert(100, 0).unwrap();
        s.assert(42, 7).unwrap();
        s.assert(70, 0).unwrap();
        assert_eq!(s.next(&arch), Some((42, 7)));
        s.mark_executed(42);
        assert_eq!(s.next(&arch), Some((70, 0)));
        // Executed but still pending.
        assert!(s.is_asserted(42));
    }

    #[test]
    fn level_line_repends_on_clear() {
        let mut s = VirqState::new(64);
        s.set_level(9, true).unwrap();
        s.assert(9, 3).unwrap();
        s.mark_executed(9);
        s.clear(9).unwrap();
        assert!(s.is_asserted(9));
        assert!(!s.is_executed(9));
        s.deassert(9).unwrap();
        s.clear(9).unwrap();
        assert!(!s.pending());
    }

    #[test]
    fn withdrawn_lines_are_reported_once() {
        let mut s = VirqState::new(64);
        s.assert(33, 0).unwrap();
        s.mark_executed(33);
        s.deassert(33).unwrap();
        assert_eq!(s.take_withdrawn(), vec![33]);
        assert!(s.take_withdrawn().is_empty());
    }
}
