//! Error kinds shared by every hypervisor subsystem.

use thiserror::Error;

/// Errors returned by hypervisor core operations.
///
/// Success is plain `Ok`. Guest-visible faults are never reported through
/// this type to callers of the trap entry points; they become an injected
/// guest exception instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("out of memory")]
    NoMem,
    #[error("invalid argument")]
    Invalid,
    #[error("no such object")]
    NotAvail,
    #[error("resource busy")]
    Busy,
    #[error("timed out")]
    Timeout,
    #[error("address range overlaps an existing mapping")]
    Overlap,
    #[error("guest-visible fault")]
    Fault,
    #[error("operation not supported")]
    Unsupp,
    #[error("host irq number out of range")]
    InvalidIrq,
    #[error("no host irq chip registered")]
    NoChip,
}

pub type Result<T = ()> = core::result::Result<T, Error>;

impl From<fdt::FdtError> for Error {
    fn from(_: fdt::FdtError) -> Self {
        Error::Invalid
    }
}
