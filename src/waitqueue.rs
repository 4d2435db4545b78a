//! Blocking primitives for hypervisor threads
//!
//! Blocking never spins: the sleeper is PAUSED and the caller is expected
//! to reach a scheduling point (`yield_current` or an IRQ exit) right
//! after. The outcome of a finished wait is read back with
//! `Hypervisor::vcpu_take_wait_result`.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch::VcpuRegs;
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use crate::sync::IrqSpinLock;
use crate::vcpu::{VcpuId, WaitKind};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Whether a wait operation blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The condition already held; keep running
    Done,
    /// The VCPU was paused; the caller must reschedule
    Blocked,
}

/// FIFO of sleeping VCPUs
pub struct WaitQueue {
    id: u64,
    sleepers: IrqSpinLock<VecDeque<VcpuId>>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            sleepers: IrqSpinLock::new(VecDeque::new()),
        }
    }

    /// Put the running VCPU `vcpu` to sleep until woken or `timeout_ns`
    /// passes. A timed-out sleep reports `Timeout`.
    pub fn sleep(&self, hv: &Hypervisor, vcpu: VcpuId, timeout_ns: Option<u64>) -> Result<WaitStatus> {
        let v = hv.vcpu_get(vcpu)?;
        let mut slot = v.wait.lock();
        if slot.kind != WaitKind::None {
            return Err(Error::Busy);
        }
        hv.block_on(&v, &mut slot, WaitKind::Queue(self.id), timeout_ns)?;
        self.sleepers.lock().push_back(vcpu);
        Ok(WaitStatus::Blocked)
    }

    /// Wake the longest sleeper. Returns false when nobody was waiting.
    pub fn wake_first(&self, hv: &Hypervisor) -> bool {
        loop {
            let Some(id) = self.sleepers.lock().pop_front() else {
                return false;
            };
            if self.wake(hv, id) {
                return true;
            }
        }
    }

    /// Wake every sleeper; returns how many were woken
    pub fn wake_all(&self, hv: &Hypervisor) -> usize {
        let mut count = 0;
        while self.wake_first(hv) {
            count += 1;
        }
        count
    }

    pub fn sleeper_count(&self) -> usize {
        self.sleepers.lock().len()
    }

    fn wake(&self, hv: &Hypervisor, id: VcpuId) -> bool {
        let Ok(v) = hv.vcpu_get(id) else {
            return false;
        };
        let mut slot = v.wait.lock();
        // Stale entry of a sleep that timed out.
        if slot.kind != WaitKind::Queue(self.id) {
            return false;
        }
        hv.wake_waiter(&v, &mut slot, Ok(()));
        true
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot or counting completion event
pub struct Completion {
    done: IrqSpinLock<u32>,
    wq: WaitQueue,
}

const COMPLETE_ALL: u32 = u32::MAX / 2;

impl Completion {
    pub fn new() -> Self {
        Self {
            done: IrqSpinLock::new(0),
            wq: WaitQueue::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock() > 0
    }

    /// Consume one completion, or sleep until one is signalled
    pub fn wait(&self, hv: &Hypervisor, vcpu: VcpuId, timeout_ns: Option<u64>) -> Result<WaitStatus> {
        let mut done = self.done.lock();
        if *done > 0 {
            if *done != COMPLETE_ALL {
                *done -= 1;
            }
            return Ok(WaitStatus::Done);
        }
        self.wq.sleep(hv, vcpu, timeout_ns)
    }

    /// Hand one completion to the first waiter, or bank it
    pub fn complete(&self, hv: &Hypervisor) {
        let mut done = self.done.lock();
        if !self.wq.wake_first(hv) && *done != COMPLETE_ALL {
            *done += 1;
        }
    }

    /// Release every current and future waiter until `reinit`
    pub fn complete_all(&self, hv: &Hypervisor) {
        let mut done = self.done.lock();
        *done = COMPLETE_ALL;
        self.wq.wake_all(hv);
    }

    pub fn reinit(&self) {
        *self.done.lock() = 0;
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor {
    /// Pause the running VCPU for `ns`; the wait result is `Ok` on expiry
    pub fn vcpu_sleep(&self, id: VcpuId, ns: u64) -> Result {
        let vcpu = self.vcpu_get(id)?;
        let mut slot = vcpu.wait.lock();
        if slot.kind != WaitKind::None {
            return Err(Error::Busy);
        }
        self.block_on(&vcpu, &mut slot, WaitKind::Sleep, Some(ns))
    }

    /// Put the current VCPU of `cpu` to sleep for `ns` and switch away
    pub fn sleep_current(&self, cpu: usize, regs: &mut VcpuRegs, ns: u64) -> Result {
        let id = self.current_vcpu_id(cpu).ok_or(Error::NotAvail)?;
        if self.is_idle_vcpu(id) {
            return Err(Error::Invalid);
        }
        self.vcpu_sleep(id, ns)?;
        self.schedule(cpu, regs);
        Ok(())
    }
}
