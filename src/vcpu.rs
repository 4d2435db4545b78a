//! Virtual CPU (vCPU) objects
//!
//! A VCPU is either a guest CPU (normal) or a hypervisor thread (orphan).
//! Both are scheduled the same way. The object is shared between host
//! CPUs, so each part of it sits behind its own lock:
//!
//! - `sched`: scheduling state, touched by the scheduler and state changes
//! - `ctx`: trap frame and private architectural state
//! - `virq`: virtual interrupt lines
//! - `wait`: blocking bookkeeping (WFI, wait queues, timed sleeps)
//!
//! Lock order is `virq` -> `wait` -> `sched` -> `ctx`.

use alloc::string::String;
use core::fmt;

use bitflags::bitflags;

use crate::arena::define_id;
use crate::arch::traits::{VcpuInit, VcpuKind};
use crate::arch::{VcpuArchState, VcpuRegs};
use crate::clocksource::NSEC_PER_MSEC;
use crate::error::Result;
use crate::guest::{GuestId, Region};
use crate::percpu::CpuMask;
use crate::sync::{IrqSpinLock, SpinLock};
use crate::timer::TimerEventId;
use crate::vcpu_interrupt::VirqState;

define_id!(
    /// Handle of a VCPU
    VcpuId
);

/// Highest scheduling priority
pub const MAX_PRIORITY: u8 = 7;
pub const NUM_PRIORITIES: usize = MAX_PRIORITY as usize + 1;
pub const DEFAULT_PRIORITY: u8 = 3;
/// Reserved for the per-CPU idle thread
pub const IDLE_PRIORITY: u8 = 0;
pub const DEFAULT_TIME_SLICE_NS: u64 = 10 * NSEC_PER_MSEC;
/// Stack of an orphan thread, in pages
pub const ORPHAN_STACK_PAGES: usize = 4;

/// Scheduling state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Reset,
    Ready,
    Running,
    Paused,
    Halted,
    Terminated,
}

impl VcpuState {
    /// State counts as "alive" for guest teardown purposes
    pub fn is_active(self) -> bool {
        matches!(self, VcpuState::Ready | VcpuState::Running | VcpuState::Paused)
    }
}

impl fmt::Display for VcpuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VcpuState::Reset => "RESET",
            VcpuState::Ready => "READY",
            VcpuState::Running => "RUNNING",
            VcpuState::Paused => "PAUSED",
            VcpuState::Halted => "HALTED",
            VcpuState::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Private architectural state a VCPU uses, switched when non-empty
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VcpuUse: u32 {
        const SYSREGS = 1 << 0;
        const VGIC = 1 << 1;
        const VTIMER = 1 << 2;
        const PAC = 1 << 3;
    }
}

/// Accounting snapshot of one VCPU
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcpuStats {
    pub ready_ns: u64,
    pub running_ns: u64,
    pub paused_ns: u64,
    pub halted_ns: u64,
    pub reset_count: u64,
    pub reset_tstamp: u64,
    /// Times the scheduler dispatched the VCPU
    pub dispatch_count: u64,
    pub irq_executed: u64,
}

/// Creation parameters
#[derive(Debug, Clone)]
pub struct VcpuParams {
    pub name: String,
    pub kind: VcpuKind,
    pub subid: u32,
    pub start_pc: u64,
    pub priority: u8,
    pub time_slice_ns: u64,
    pub affinity: CpuMask,
    pub big_endian: bool,
    pub nr_virqs: u32,
    /// Left in RESET by a guest kick
    pub poweroff: bool,
}

pub(crate) struct VcpuSched {
    pub state: VcpuState,
    pub priority: u8,
    pub time_slice_ns: u64,
    /// Unused part of the slice; refilled when it runs out
    pub residual_ns: u64,
    /// CPU whose run queue the VCPU belongs to
    pub host_cpu: usize,
    pub affinity: CpuMask,
    /// CPU currently holding the VCPU's registers, until switched out
    pub on_cpu: Option<usize>,
    pub yielded: bool,
    pub reset_pending: bool,
    pub state_tstamp: u64,
    pub dispatch_tstamp: u64,
    pub stats: VcpuStats,
}

impl VcpuSched {
    /// Charge the time spent in the current state up to `now`
    pub fn account(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.state_tstamp);
        self.state_tstamp = now;
        match self.state {
            VcpuState::Ready => self.stats.ready_ns += elapsed,
            VcpuState::Running => self.stats.running_ns += elapsed,
            VcpuState::Paused => self.stats.paused_ns += elapsed,
            VcpuState::Halted => self.stats.halted_ns += elapsed,
            VcpuState::Reset | VcpuState::Terminated => {}
        }
    }

    pub fn set_state(&mut self, state: VcpuState, now: u64) {
        self.account(now);
        self.state = state;
    }
}

pub(crate) struct VcpuContext {
    pub regs: VcpuRegs,
    pub arch: VcpuArchState,
    /// Private state loaded on a CPU may differ from `arch`
    pub private_dirty: bool,
    pub init: VcpuInit,
}

/// What a VCPU is blocked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    None,
    Irq,
    /// Sleeping on the wait queue with this id
    Queue(u64),
    Sleep,
}

pub(crate) struct WaitSlot {
    pub kind: WaitKind,
    pub timer: Option<TimerEventId>,
    pub result: Option<Result>,
}

impl WaitSlot {
    /// Outcome of timer event `ev` expiring, `None` when `ev` no longer
    /// bounds the current wait
    pub fn timeout_result(&self, ev: TimerEventId) -> Option<Result> {
        if self.timer != Some(ev) {
            return None;
        }
        match self.kind {
            WaitKind::None => None,
            WaitKind::Sleep => Some(Ok(())),
            WaitKind::Irq | WaitKind::Queue(_) => Some(Err(crate::error::Error::Timeout)),
        }
    }
}

pub struct Vcpu {
    pub(crate) id: VcpuId,
    pub(crate) subid: u32,
    pub(crate) name: String,
    pub(crate) kind: VcpuKind,
    pub(crate) guest: Option<GuestId>,
    pub(crate) uses: VcpuUse,
    pub(crate) poweroff: bool,
    /// Orphan stack as (virtual address, pages)
    pub(crate) stack: Option<(usize, usize)>,
    pub(crate) sched: IrqSpinLock<VcpuSched>,
    pub(crate) ctx: IrqSpinLock<VcpuContext>,
    pub(crate) virq: IrqSpinLock<VirqState>,
    pub(crate) wait: IrqSpinLock<WaitSlot>,
    pub(crate) mmio_cache: SpinLock<Option<(u64, Region)>>,
}

impl Vcpu {
    pub(crate) fn new(
        id: VcpuId,
        params: &VcpuParams,
        guest: Option<GuestId>,
        stack: Option<(usize, usize)>,
        host_cpu: usize,
        now: u64,
    ) -> Self {
        let stack_top = stack
            .map(|(va, pages)| (va + pages * crate::mm::PAGE_SIZE as usize) as u64)
            .unwrap_or(0);
        let init = VcpuInit {
            kind: params.kind,
            subid: params.subid,
            start_pc: params.start_pc,
            stack_top,
            big_endian: params.big_endian,
        };
        let uses = match params.kind {
            VcpuKind::Normal => VcpuUse::all(),
            VcpuKind::Orphan => VcpuUse::empty(),
        };
        Self {
            id,
            subid: params.subid,
            name: params.name.clone(),
            kind: params.kind,
            guest,
            uses,
            poweroff: params.poweroff,
            stack,
            sched: IrqSpinLock::new(VcpuSched {
                state: VcpuState::Reset,
                priority: params.priority.min(MAX_PRIORITY),
                time_slice_ns: params.time_slice_ns,
                residual_ns: params.time_slice_ns,
                host_cpu,
                affinity: params.affinity,
                on_cpu: None,
                yielded: false,
                reset_pending: false,
                state_tstamp: now,
                dispatch_tstamp: now,
                stats: VcpuStats::default(),
            }),
            ctx: IrqSpinLock::new(VcpuContext {
                regs: VcpuRegs::default(),
                arch: VcpuArchState::default(),
                private_dirty: false,
                init,
            }),
            virq: IrqSpinLock::new(VirqState::new(params.nr_virqs)),
            wait: IrqSpinLock::new(WaitSlot {
                kind: WaitKind::None,
                timer: None,
                result: None,
            }),
            mmio_cache: SpinLock::new(None),
        }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// Index inside the guest
    pub fn subid(&self) -> u32 {
        self.subid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VcpuKind {
        self.kind
    }

    pub fn is_normal(&self) -> bool {
        self.kind == VcpuKind::Normal
    }

    pub fn guest(&self) -> Option<GuestId> {
        self.guest
    }

    pub fn state(&self) -> VcpuState {
        self.sched.lock().state
    }

    pub fn priority(&self) -> u8 {
        self.sched.lock().priority
    }

    pub fn host_cpu(&self) -> usize {
        self.sched.lock().host_cpu
    }

    pub fn affinity(&self) -> CpuMask {
        self.sched.lock().affinity
    }

    /// Trap frame as of the last switch-out
    pub fn regs(&self) -> VcpuRegs {
        self.ctx.lock().regs
    }

    /// Private state as of the last save
    pub fn arch_state(&self) -> VcpuArchState {
        self.ctx.lock().arch
    }
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("guest", &self.guest)
            .finish()
    }
}
