//! Architecture-specific code
//!
//! The portable core only sees `traits`, `intrinsics` and the register
//! types re-exported here. AArch64 is the only architecture; its pure parts
//! build on every host so the core can be unit-tested.

pub mod aarch64;
pub mod intrinsics;
pub mod traits;

pub use aarch64::hosted::HostedAarch64;
#[cfg(hv_bare_metal)]
pub use aarch64::native::Aarch64Native;
pub use aarch64::{VcpuArchState, VcpuRegs};
pub use traits::*;
