//! ARM64 Peripheral Drivers
//!
//! - GIC (Generic Interrupt Controller), host side
//! - ARM Generic Timer as clocksource and clockchip

pub mod gic;
#[cfg(hv_bare_metal)]
pub mod timer;

pub use gic::Gic;
#[cfg(hv_bare_metal)]
pub use timer::{GenericCounter, HypTimer};
