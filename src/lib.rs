//! Portable type-1 hypervisor core
//!
//! Schedules VCPUs of guests and hypervisor threads over host CPUs, keeps
//! each guest's physical address space and second-stage tables, routes
//! host interrupts, delivers virtual interrupts and dispatches MMIO to
//! device emulators. Everything hardware-specific sits behind the traits
//! in [`arch::traits`]; the AArch64 backend lives in [`arch::aarch64`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod arena;
pub mod board;
pub mod class;
pub mod clocksource;
pub mod cmdline;
pub mod config;
pub mod console;
pub mod devices;
pub mod dtb;
pub mod error;
pub mod guest;
pub mod host_irq;
pub mod hypervisor;
pub mod manager;
pub mod mm;
pub mod percpu;
pub mod scheduler;
pub mod sync;
pub mod timer;
pub mod uart;
pub mod vcpu;
pub mod vcpu_interrupt;
pub mod waitqueue;

pub use config::{GuestConfig, RegionConfig, VcpuConfig, VmmConfig};
pub use error::{Error, Result};
pub use guest::{Guest, GuestId};
pub use hypervisor::{Hypervisor, Platform};
pub use vcpu::{Vcpu, VcpuId, VcpuState};
