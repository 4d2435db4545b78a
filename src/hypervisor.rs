//! Top-level hypervisor context and the entry points used by the
//! architecture stub.
//!
//! `Hypervisor` owns every subsystem. Host CPU `n` only ever calls entry
//! points with `cpu == n`, passing the trap frame of whatever it was
//! running; the frame is rewritten in place when the scheduler switches.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use log::{error, info, warn};
use spin::RwLock;

use crate::arch::aarch64::defs::AARCH64_INSN_SIZE;
use crate::arch::aarch64::hypervisor::trap::GuestTrap;
use crate::arch::traits::{
    ClockChip, ClockSource, GuestException, HostIrqChip, VcpuArch, VcpuContextOps,
};
use crate::arch::{intrinsics, VcpuRegs};
use crate::arena::Arena;
use crate::board::Board;
use crate::class::ClassRegistry;
use crate::clocksource::Clock;
use crate::cmdline;
use crate::config::VmmConfig;
use crate::console::CHARDEV_CLASS;
use crate::devices::pl031::Pl031Emulator;
use crate::devices::zero::ZeroEmulator;
use crate::devices::EmulatorRegistry;
use crate::error::{Error, Result};
use crate::guest::{FaultOutcome, Guest, GuestId, Stage2Fault};
use crate::host_irq::{HostIrqs, IrqReturn};
use crate::mm::{HostAspace, HostRamPool, VmidPool};
use crate::scheduler::SchedCpu;
use crate::sync::{IrqSpinLock, SpinLock};
use crate::timer::{TimerAction, TimerCpu, TimerEvent};
use crate::vcpu::{Vcpu, DEFAULT_TIME_SLICE_NS};
use crate::waitqueue::WaitStatus;

/// State owned by one host CPU
pub(crate) struct HostCpu {
    pub(crate) sched: SchedCpu,
    pub(crate) timer: TimerCpu,
    pub(crate) clockchip: Option<Arc<dyn ClockChip>>,
    /// Guest whose stage-2 is loaded (`GuestId` bits, 0 = none)
    pub(crate) stage2_guest: AtomicU64,
}

/// Hardware handed to the core at construction
pub struct Platform {
    pub arch: Arc<dyn VcpuArch>,
    pub irq_chip: Option<Arc<dyn HostIrqChip>>,
    pub clocksource: Arc<dyn ClockSource>,
    /// One per host CPU; a missing entry leaves that CPU without timer events
    pub clockchips: Vec<Arc<dyn ClockChip>>,
    pub ram: HostRamPool,
}

pub struct Hypervisor {
    pub(crate) config: VmmConfig,
    pub(crate) board: Board,
    pub(crate) arch: Arc<dyn VcpuArch>,
    pub(crate) cpus: Vec<HostCpu>,
    pub(crate) guests: RwLock<Arena<Arc<Guest>>>,
    pub(crate) vcpus: RwLock<Arena<Arc<Vcpu>>>,
    pub(crate) irqs: HostIrqs,
    pub(crate) host: HostAspace,
    pub(crate) emulators: EmulatorRegistry,
    pub(crate) classes: ClassRegistry,
    pub(crate) clock: Clock,
    pub(crate) timers: IrqSpinLock<Arena<TimerEvent>>,
    pub(crate) vmids: SpinLock<VmidPool>,
    pub(crate) default_slice_ns: u64,
}

impl Hypervisor {
    /// Bring up every subsystem and create the configured guests.
    ///
    /// Guests are left in RESET; `guest_kick` starts them.
    pub fn new(mut config: VmmConfig, platform: Platform) -> Result<Self> {
        let board = Board::detect(&config.compatible)?;
        cmdline::apply(&mut config);
        if let Some(level) = config.log_level {
            log::set_max_level(level);
        }
        let nr_cpus = config.cpus.len().max(1);
        if nr_cpus > crate::percpu::MAX_CPUS {
            return Err(Error::Invalid);
        }
        info!("{} with {} cpus, arch {}", board.name(), nr_cpus, platform.arch.name());

        let cpus = (0..nr_cpus)
            .map(|i| HostCpu {
                sched: SchedCpu::new(),
                timer: TimerCpu::new(),
                clockchip: platform.clockchips.get(i).cloned(),
                stage2_guest: AtomicU64::new(0),
            })
            .collect();
        let default_slice_ns = match config.sched_tick_ns {
            0 => DEFAULT_TIME_SLICE_NS,
            ns => ns,
        };

        let hv = Self {
            board,
            arch: platform.arch,
            cpus,
            guests: RwLock::new(Arena::new()),
            vcpus: RwLock::new(Arena::new()),
            irqs: HostIrqs::new(),
            host: HostAspace::new(platform.ram),
            emulators: EmulatorRegistry::new(),
            classes: ClassRegistry::new(),
            clock: Clock::new(),
            timers: IrqSpinLock::new(Arena::new()),
            vmids: SpinLock::new(VmidPool::new()),
            default_slice_ns,
            config,
        };

        hv.clock.register(platform.clocksource);
        if let Some(period) = hv.clock.refresh_period_ns() {
            let ev = hv.timer_event_create("clock-refresh", 0, TimerAction::ClockRefresh)?;
            hv.timer_event_start(ev, period)?;
        }
        if let Some(chip) = platform.irq_chip {
            hv.host_irq_register_chip(chip)?;
            hv.clockchip_irq_setup()?;
        }

        for cpu in 0..hv.cpus.len() {
            let ev = hv.timer_event_create("sched-slice", cpu, TimerAction::SchedTick)?;
            hv.cpus[cpu].sched.slice_event.call_once(|| ev);
            let idle = hv.idle_create(cpu, idle_thread as usize as u64)?;
            hv.cpus[cpu].sched.idle.call_once(|| idle);
        }

        hv.classes.register_class(CHARDEV_CLASS)?;
        hv.emulator_register(Arc::new(ZeroEmulator))?;
        hv.emulator_register(Arc::new(Pl031Emulator))?;
        hv.create_guests()?;
        Ok(hv)
    }

    fn clockchip_irq_setup(&self) -> Result {
        let mut hirqs: Vec<u32> = self
            .cpus
            .iter()
            .filter_map(|c| c.clockchip.as_ref().map(|chip| chip.hirq()))
            .collect();
        hirqs.sort_unstable();
        hirqs.dedup();
        for hirq in hirqs {
            self.host_irq_mark_per_cpu(hirq)?;
            self.host_irq_register(
                hirq,
                "clockchip",
                Arc::new(|hv: &Hypervisor, _irq: u32, cpu: usize, _opaque: usize| {
                    hv.timer_irq(cpu);
                    IrqReturn::Handled
                }),
                0,
            )?;
        }
        Ok(())
    }

    /// Create every guest of the boot configuration
    pub fn create_guests(&self) -> Result {
        for cfg in self.config.guests.iter() {
            if let Err(e) = self.guest_create(cfg) {
                error!("guest {}: {}", cfg.name, e);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &VmmConfig {
        &self.config
    }

    pub fn host(&self) -> &HostAspace {
        &self.host
    }

    pub fn arch(&self) -> &dyn VcpuArch {
        self.arch.as_ref()
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn default_time_slice_ns(&self) -> u64 {
        self.default_slice_ns
    }

    /// First entry of `cpu` into the core: start the idle thread, then
    /// switch to whatever is ready
    pub fn start_cpu(&self, cpu: usize, regs: &mut VcpuRegs) -> Result {
        if cpu >= self.cpus.len() {
            return Err(Error::Invalid);
        }
        self.sched_start(cpu, regs)?;
        info!("cpu{} online", cpu);
        self.schedule(cpu, regs);
        Ok(())
    }

    /// Host interrupt taken on `cpu`
    pub fn handle_irq(&self, cpu: usize, regs: &mut VcpuRegs) {
        loop {
            match self.host_irq_handle_active(cpu) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!("cpu{}: irq handling failed: {}", cpu, e);
                    break;
                }
            }
        }
        self.irq_exit(cpu, regs);
    }

    /// Common exit path: reschedule if asked to, then deliver pending
    /// virtual IRQs to the VCPU about to run
    pub fn irq_exit(&self, cpu: usize, regs: &mut VcpuRegs) {
        if self.sched_need_resched(cpu) {
            self.schedule(cpu, regs);
        }
        if let Some(vcpu) = self.current_vcpu(cpu) {
            if vcpu.is_normal() {
                self.vcpu_irq_process(cpu, &vcpu, regs);
            }
        }
    }

    /// Second-stage fault of the current VCPU of `cpu`
    pub fn handle_stage2_fault(&self, cpu: usize, regs: &mut VcpuRegs, fault: &Stage2Fault) -> FaultOutcome {
        let Some(vcpu) = self.current_vcpu(cpu) else {
            self.handle_fatal(cpu, regs, "stage-2 fault with no current vcpu");
        };
        let Some(guest) = vcpu.guest.and_then(|g| self.guest_find(g)) else {
            self.handle_fatal(cpu, regs, "stage-2 fault from an orphan");
        };
        let outcome = self.guest_handle_fault(cpu, &vcpu, &guest, regs, fault);
        if outcome == FaultOutcome::Halted {
            self.schedule(cpu, regs);
        }
        self.irq_exit(cpu, regs);
        outcome
    }

    /// Guest executed its wait-for-interrupt instruction.
    ///
    /// `regs.pc` must already point past the instruction.
    pub fn handle_wfi(&self, cpu: usize, regs: &mut VcpuRegs) -> Result<WaitStatus> {
        let vcpu = self.current_vcpu(cpu).ok_or(Error::NotAvail)?;
        if !vcpu.is_normal() {
            return Err(Error::Invalid);
        }
        let status = self.vcpu_irq_wait(vcpu.id, None)?;
        if status == WaitStatus::Blocked {
            self.schedule(cpu, regs);
        }
        self.irq_exit(cpu, regs);
        Ok(status)
    }

    /// Current VCPU of `cpu` gives up the rest of its slice
    pub fn yield_current(&self, cpu: usize, regs: &mut VcpuRegs) {
        if let Some(vcpu) = self.current_vcpu(cpu) {
            if !self.is_idle_vcpu(vcpu.id) {
                let _ = self.vcpu_yield(vcpu.id);
            }
        }
        self.schedule(cpu, regs);
        self.irq_exit(cpu, regs);
    }

    /// Dispatch a classified AArch64 guest exit
    pub fn handle_trap(&self, cpu: usize, regs: &mut VcpuRegs, trap: &GuestTrap) {
        match trap {
            GuestTrap::Wfi => {
                regs.advance_pc(AARCH64_INSN_SIZE);
                if let Err(e) = self.handle_wfi(cpu, regs) {
                    warn!("cpu{}: wfi: {}", cpu, e);
                }
            }
            GuestTrap::Stage2Fault(fault) => {
                self.handle_stage2_fault(cpu, regs, fault);
            }
            GuestTrap::Hypercall(_) | GuestTrap::Other(_) => {
                if let Err(e) = self.arch.inject_exception(cpu, regs, &GuestException::Undefined) {
                    warn!("cpu{}: undef injection failed: {}", cpu, e);
                }
                self.irq_exit(cpu, regs);
            }
        }
    }

    /// Unrecoverable condition on `cpu`
    pub fn handle_fatal(&self, cpu: usize, regs: &VcpuRegs, msg: &str) -> ! {
        let name = self
            .current_vcpu(cpu)
            .map(|v| alloc::string::String::from(v.name()))
            .unwrap_or_default();
        error!("cpu{}: fatal: {} (vcpu {})", cpu, msg, name);
        panic!("cpu{}: {}\n{:?}", cpu, msg, regs);
    }

    /// Whether the guest with `id` has its stage-2 loaded on `cpu`
    pub fn stage2_loaded(&self, cpu: usize, id: GuestId) -> bool {
        self.cpus
            .get(cpu)
            .map_or(false, |c| c.stage2_guest.load(Ordering::Acquire) == id.to_bits())
    }
}

/// Body of every idle orphan
extern "C" fn idle_thread() -> ! {
    loop {
        intrinsics::wait_for_interrupt();
    }
}
