//! Per-CPU strict-priority scheduler
//!
//! Each host CPU owns a run queue with one FIFO band per priority. The
//! highest non-empty band wins; within a band VCPUs take turns once their
//! time slice runs out. A per-CPU idle orphan runs when every band is empty
//! and is never queued itself.
//!
//! A VCPU switched out keeps `on_cpu` set until its registers are saved, so
//! no other CPU can pick it up half-saved. State changes that make such a
//! VCPU runnable leave the queueing to the switch-out path.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::array;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use log::{debug, trace};
use spin::Once;

use crate::arch::intrinsics::cmpxchg;
use crate::arch::VcpuRegs;
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use crate::percpu::CpuMask;
use crate::sync::IrqSpinLock;
use crate::timer::TimerEventId;
use crate::vcpu::{Vcpu, VcpuId, VcpuSched, VcpuState, VcpuStats, NUM_PRIORITIES};

pub(crate) struct RunQueue {
    bands: [VecDeque<VcpuId>; NUM_PRIORITIES],
    current: Option<Arc<Vcpu>>,
    current_prio: u8,
    current_idle: bool,
}

impl RunQueue {
    fn new() -> Self {
        Self {
            bands: array::from_fn(|_| VecDeque::new()),
            current: None,
            current_prio: 0,
            current_idle: true,
        }
    }

    fn push(&mut self, prio: u8, id: VcpuId) {
        self.bands[prio as usize].push_back(id);
    }

    fn remove(&mut self, id: VcpuId) {
        for band in self.bands.iter_mut() {
            band.retain(|&v| v != id);
        }
    }

    fn pop(&mut self) -> Option<VcpuId> {
        self.bands.iter_mut().rev().find_map(|band| band.pop_front())
    }

    fn best_priority(&self) -> Option<u8> {
        self.bands
            .iter()
            .rposition(|band| !band.is_empty())
            .map(|p| p as u8)
    }

    fn len(&self) -> usize {
        self.bands.iter().map(|b| b.len()).sum()
    }
}

pub(crate) struct SchedCpu {
    rq: IrqSpinLock<RunQueue>,
    need_resched: AtomicBool,
    preempt_count: AtomicU32,
    /// VCPU whose private state is loaded on this CPU (`VcpuId` bits, 0 = none)
    private_owner: AtomicU64,
    pub(crate) idle: Once<Arc<Vcpu>>,
    pub(crate) slice_event: Once<TimerEventId>,
}

impl SchedCpu {
    pub(crate) fn new() -> Self {
        Self {
            rq: IrqSpinLock::new(RunQueue::new()),
            need_resched: AtomicBool::new(false),
            preempt_count: AtomicU32::new(0),
            private_owner: AtomicU64::new(0),
            idle: Once::new(),
            slice_event: Once::new(),
        }
    }
}

impl Hypervisor {
    /// VCPU currently dispatched on `cpu`
    pub fn current_vcpu(&self, cpu: usize) -> Option<Arc<Vcpu>> {
        self.cpus.get(cpu)?.sched.rq.lock().current.clone()
    }

    pub fn current_vcpu_id(&self, cpu: usize) -> Option<VcpuId> {
        self.current_vcpu(cpu).map(|v| v.id)
    }

    /// Number of VCPUs queued on `cpu`, not counting the current one
    pub fn sched_ready_count(&self, cpu: usize) -> usize {
        self.cpus.get(cpu).map(|c| c.sched.rq.lock().len()).unwrap_or(0)
    }

    pub fn sched_need_resched(&self, cpu: usize) -> bool {
        self.cpus
            .get(cpu)
            .map(|c| c.sched.need_resched.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Defer rescheduling on `cpu` until the matching `preempt_enable`
    pub fn preempt_disable(&self, cpu: usize) {
        self.cpus[cpu].sched.preempt_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when a deferred reschedule is now due
    pub fn preempt_enable(&self, cpu: usize) -> bool {
        let sc = &self.cpus[cpu].sched;
        let prev = sc.preempt_count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            panic!("cpu{}: unbalanced preempt_enable", cpu);
        }
        prev == 1 && sc.need_resched.load(Ordering::Acquire)
    }

    pub(crate) fn is_idle_vcpu(&self, id: VcpuId) -> bool {
        self.cpus
            .iter()
            .any(|c| c.sched.idle.get().map_or(false, |idle| idle.id == id))
    }

    pub(crate) fn request_resched(&self, cpu: usize) {
        self.cpus[cpu].sched.need_resched.store(true, Ordering::Release);
        self.arch.kick_cpu(cpu);
    }

    /// Time slice of `cpu`'s current VCPU ran out
    pub(crate) fn sched_tick(&self, cpu: usize) {
        self.cpus[cpu].sched.need_resched.store(true, Ordering::Release);
    }

    /// Give up the rest of the slice to VCPUs of the same priority
    pub fn vcpu_yield(&self, id: VcpuId) -> Result {
        let vcpu = self.vcpu_get(id)?;
        let mut s = vcpu.sched.lock();
        if s.state != VcpuState::Running {
            return Err(Error::Invalid);
        }
        s.yielded = true;
        if let Some(cpu) = s.on_cpu {
            self.request_resched(cpu);
        }
        Ok(())
    }

    fn enqueue(&self, vcpu: &Vcpu, s: &VcpuSched) {
        let cpu = s.host_cpu;
        let preempt = {
            let mut rq = self.cpus[cpu].sched.rq.lock();
            rq.push(s.priority, vcpu.id);
            rq.current_idle || s.priority > rq.current_prio
        };
        trace!("cpu{}: enqueue {} prio {}", cpu, vcpu.name, s.priority);
        if preempt {
            self.request_resched(cpu);
        }
    }

    fn dequeue(&self, vcpu: &Vcpu, s: &VcpuSched) {
        self.cpus[s.host_cpu].sched.rq.lock().remove(vcpu.id);
    }

    /// Validated state transition
    ///
    /// VCPUs that leave the runnable states are dequeued, or their CPU is
    /// told to switch them out. Entering RESET reinitializes the register
    /// frame once the VCPU is off its CPU; virtual IRQ state is the
    /// caller's business.
    pub(crate) fn state_change(&self, vcpu: &Vcpu, new: VcpuState) -> Result {
        use VcpuState::*;

        let now = self.timestamp();
        let mut s = vcpu.sched.lock();
        let old = s.state;
        let valid = match (old, new) {
            (Reset, Ready) | (Paused, Ready) => true,
            (Ready | Running, Paused) => true,
            (Ready | Running | Paused, Halted) => true,
            (Terminated, Reset) => false,
            (_, Reset) => true,
            (Running | Terminated, Terminated) => false,
            (_, Terminated) => true,
            _ => false,
        };
        if !valid {
            return Err(Error::Invalid);
        }
        s.set_state(new, now);
        debug!("{}: {} -> {}", vcpu.name, old, new);

        match new {
            Ready => match s.on_cpu {
                None => self.enqueue(vcpu, &s),
                Some(cpu) => self.request_resched(cpu),
            },
            _ => {
                match s.on_cpu {
                    None if old == Ready => self.dequeue(vcpu, &s),
                    Some(cpu) => self.request_resched(cpu),
                    None => {}
                }
                if new == Reset {
                    s.stats.reset_count += 1;
                    s.stats.reset_tstamp = now;
                    s.residual_ns = s.time_slice_ns;
                    s.yielded = false;
                    if s.on_cpu.is_some() {
                        s.reset_pending = true;
                    } else {
                        self.reinit(vcpu)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn private_owner_release(&self, vcpu: &Vcpu) {
        let bits = vcpu.id.to_bits();
        for host in self.cpus.iter() {
            cmpxchg(&host.sched.private_owner, bits, 0);
        }
    }

    /// Load the reset register frame; the VCPU must be off every CPU
    pub(crate) fn reinit(&self, vcpu: &Vcpu) -> Result {
        self.private_owner_release(vcpu);
        let mut ctx = vcpu.ctx.lock();
        let ctx = &mut *ctx;
        ctx.private_dirty = false;
        self.arch.vcpu_init(&ctx.init, &mut ctx.regs, &mut ctx.arch)
    }

    /// Accounting snapshot including the time spent in the current state
    pub fn vcpu_stats(&self, id: VcpuId) -> Result<VcpuStats> {
        let vcpu = self.vcpu_get(id)?;
        let mut s = vcpu.sched.lock();
        s.account(self.timestamp());
        Ok(s.stats.clone())
    }

    /// Restrict the VCPU to `mask`, migrating it if its CPU left the mask
    pub fn vcpu_set_affinity(&self, id: VcpuId, mask: CpuMask) -> Result {
        let online = CpuMask::all(self.cpus.len());
        let mask = mask.and(online);
        let target = mask.first().ok_or(Error::Invalid)?;
        let vcpu = self.vcpu_get(id)?;
        if self.is_idle_vcpu(id) {
            return Err(Error::Invalid);
        }

        let mut s = vcpu.sched.lock();
        s.affinity = mask;
        let from = s.host_cpu;
        if mask.contains(from) {
            return Ok(());
        }
        match (s.state, s.on_cpu) {
            (VcpuState::Ready, None) => {
                let (lo, hi) = if from < target { (from, target) } else { (target, from) };
                let mut rq_lo = self.cpus[lo].sched.rq.lock();
                let mut rq_hi = self.cpus[hi].sched.rq.lock();
                let (src, dst) = if from < target {
                    (&mut rq_lo, &mut rq_hi)
                } else {
                    (&mut rq_hi, &mut rq_lo)
                };
                src.remove(vcpu.id);
                dst.push(s.priority, vcpu.id);
                let preempt = dst.current_idle || s.priority > dst.current_prio;
                s.host_cpu = target;
                drop(rq_hi);
                drop(rq_lo);
                if preempt {
                    self.request_resched(target);
                }
            }
            (_, Some(cpu)) => {
                s.host_cpu = target;
                self.request_resched(cpu);
            }
            _ => s.host_cpu = target,
        }
        debug!("{}: migrated cpu{} -> cpu{}", vcpu.name, from, target);
        Ok(())
    }

    /// Dispatch the idle thread as the first current VCPU of `cpu`
    pub(crate) fn sched_start(&self, cpu: usize, regs: &mut VcpuRegs) -> Result {
        let sc = &self.cpus[cpu].sched;
        let idle = sc.idle.get().cloned().ok_or(Error::NotAvail)?;
        let now = self.timestamp();
        {
            let mut s = idle.sched.lock();
            s.set_state(VcpuState::Running, now);
            s.on_cpu = Some(cpu);
            s.dispatch_tstamp = now;
        }
        *regs = idle.ctx.lock().regs;
        let mut rq = sc.rq.lock();
        rq.current = Some(idle);
        rq.current_prio = 0;
        rq.current_idle = true;
        Ok(())
    }

    /// Pick the next VCPU for `cpu` and switch `regs` to it
    pub(crate) fn schedule(&self, cpu: usize, regs: &mut VcpuRegs) {
        let sc = &self.cpus[cpu].sched;
        if sc.preempt_count.load(Ordering::Acquire) > 0 {
            sc.need_resched.store(true, Ordering::Release);
            return;
        }
        sc.need_resched.store(false, Ordering::Release);

        let Some(idle) = sc.idle.get().cloned() else {
            return;
        };
        let Some(cur) = sc.rq.lock().current.clone() else {
            return;
        };
        let cur_idle = Arc::ptr_eq(&cur, &idle);
        let now = self.timestamp();

        let mut runnable = false;
        if !cur_idle {
            let mut s = cur.sched.lock();
            runnable = matches!(s.state, VcpuState::Running | VcpuState::Ready)
                && s.host_cpu == cpu
                && !s.reset_pending;
            if runnable {
                let left = s.residual_ns.saturating_sub(now.saturating_sub(s.dispatch_tstamp));
                let best = sc.rq.lock().best_priority();
                let keep = match best {
                    None => true,
                    Some(b) if b < s.priority => true,
                    Some(b) if b == s.priority => left > 0 && !s.yielded,
                    Some(_) => false,
                };
                if keep {
                    self.keep_current(cpu, &mut s, left, now);
                    return;
                }
            }
        }

        let next = loop {
            let Some(id) = sc.rq.lock().pop() else {
                break None;
            };
            let Some(v) = self.vcpu_find(id) else {
                continue;
            };
            let mut s = v.sched.lock();
            if s.state != VcpuState::Ready || s.on_cpu.is_some() || s.host_cpu != cpu {
                continue;
            }
            sc.rq.lock().remove(id);
            s.set_state(VcpuState::Running, now);
            s.on_cpu = Some(cpu);
            s.dispatch_tstamp = now;
            s.yielded = false;
            s.stats.dispatch_count += 1;
            if s.residual_ns == 0 {
                s.residual_ns = s.time_slice_ns;
            }
            drop(s);
            break Some(v);
        };

        let next = match next {
            Some(v) => v,
            None if cur_idle => return,
            None if runnable => {
                let mut s = cur.sched.lock();
                let left = s.residual_ns.saturating_sub(now.saturating_sub(s.dispatch_tstamp));
                self.keep_current(cpu, &mut s, left, now);
                return;
            }
            None => {
                let mut s = idle.sched.lock();
                s.set_state(VcpuState::Running, now);
                s.on_cpu = Some(cpu);
                s.dispatch_tstamp = now;
                drop(s);
                idle.clone()
            }
        };

        let next_idle = Arc::ptr_eq(&next, &idle);
        let (prio, slice) = {
            let s = next.sched.lock();
            (s.priority, s.residual_ns)
        };
        trace!("cpu{}: switch {} -> {}", cpu, cur.name, next.name);
        self.context_switch(cpu, &cur, &next, regs);
        {
            let mut rq = sc.rq.lock();
            rq.current = Some(next.clone());
            rq.current_prio = prio;
            rq.current_idle = next_idle;
        }
        self.switch_out(&cur, cur_idle, now);

        if let Some(&ev) = sc.slice_event.get() {
            let _ = if next_idle {
                self.timer_event_stop(ev)
            } else {
                self.timer_event_start(ev, slice)
            };
        }
    }

    fn keep_current(&self, cpu: usize, s: &mut VcpuSched, left: u64, now: u64) {
        if s.state == VcpuState::Ready {
            s.set_state(VcpuState::Running, now);
        }
        s.yielded = false;
        if left == 0 {
            s.residual_ns = s.time_slice_ns;
            s.dispatch_tstamp = now;
            if let Some(&ev) = self.cpus[cpu].sched.slice_event.get() {
                let _ = self.timer_event_start(ev, s.residual_ns);
            }
        }
    }

    /// Book-keeping for a VCPU whose registers were just saved
    fn switch_out(&self, vcpu: &Vcpu, is_idle: bool, now: u64) {
        let mut s = vcpu.sched.lock();
        s.on_cpu = None;
        if is_idle {
            s.set_state(VcpuState::Ready, now);
            return;
        }
        let used = now.saturating_sub(s.dispatch_tstamp);
        s.residual_ns = s.residual_ns.saturating_sub(used);
        if s.residual_ns == 0 {
            s.residual_ns = s.time_slice_ns;
        }
        if s.reset_pending {
            s.reset_pending = false;
            if let Err(e) = self.reinit(vcpu) {
                log::error!("{}: reinit failed: {}", vcpu.name, e);
            }
        }
        match s.state {
            VcpuState::Running | VcpuState::Ready => {
                s.set_state(VcpuState::Ready, now);
                self.enqueue(vcpu, &s);
            }
            _ => {}
        }
    }

    /// Swap the trap frame and private state of `out` for those of `inc`
    fn context_switch(&self, cpu: usize, out: &Vcpu, inc: &Vcpu, regs: &mut VcpuRegs) {
        let arch = self.arch.as_ref();
        let host = &self.cpus[cpu];
        {
            let mut ctx = out.ctx.lock();
            ctx.regs = *regs;
            if !out.uses.is_empty() && ctx.private_dirty {
                arch.save_private(cpu, &mut ctx.arch);
                ctx.private_dirty = false;
            }
        }
        {
            let mut ctx = inc.ctx.lock();
            if !inc.uses.is_empty() {
                let bits = inc.id.to_bits();
                if host.sched.private_owner.load(Ordering::Acquire) != bits {
                    arch.restore_private(cpu, &ctx.arch);
                    host.sched.private_owner.store(bits, Ordering::Release);
                    for (i, other) in self.cpus.iter().enumerate() {
                        if i != cpu {
                            cmpxchg(&other.sched.private_owner, bits, 0);
                        }
                    }
                }
                ctx.private_dirty = true;
            }
            *regs = ctx.regs;
        }
        let target = inc.guest.map(|g| g.to_bits()).unwrap_or(0);
        if host.stage2_guest.swap(target, Ordering::AcqRel) != target {
            let root = inc.guest.and_then(|g| self.guest_stage2_root(g));
            arch.switch_stage2(cpu, root);
        }
    }
}
