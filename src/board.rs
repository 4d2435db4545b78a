//! Supported boards
//!
//! A board is recognized by the root `compatible` of the host device tree.
//! Reset and power-off go through the platform firmware.

use alloc::string::String;

use log::{error, info};

use crate::arch::traits::FirmwareCall;
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;

pub const QEMU_VIRT_COMPATIBLE: &str = "linux,dummy-virt";
pub const QEMU_VIRT_ALT_COMPATIBLE: &str = "qemu,virt";
pub const FVP_BASE_COMPATIBLE: &str = "arm,fvp-base";
pub const FVP_BASE_REVC_COMPATIBLE: &str = "arm,fvp-base-revc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    QemuVirt,
    FvpBase,
}

impl Board {
    fn from_compatible(compat: &str) -> Option<Self> {
        match compat {
            QEMU_VIRT_COMPATIBLE | QEMU_VIRT_ALT_COMPATIBLE => Some(Board::QemuVirt),
            FVP_BASE_COMPATIBLE | FVP_BASE_REVC_COMPATIBLE => Some(Board::FvpBase),
            _ => None,
        }
    }

    /// First supported entry of a root `compatible` list
    pub fn detect(compatible: &[String]) -> Result<Self> {
        compatible
            .iter()
            .find_map(|c| Self::from_compatible(c))
            .ok_or(Error::Unsupp)
    }

    pub fn name(self) -> &'static str {
        match self {
            Board::QemuVirt => "QEMU virt",
            Board::FvpBase => "Arm FVP base",
        }
    }
}

impl Hypervisor {
    pub fn board(&self) -> Board {
        self.board
    }

    /// Reset the whole machine. Returns only on failure.
    pub fn board_reset(&self) -> Result {
        info!("{}: system reset", self.board.name());
        self.arch.firmware_call(FirmwareCall::SystemReset).map_err(|e| {
            error!("system reset failed: {}", e);
            e
        })
    }

    /// Power the machine off. Returns only on failure.
    pub fn board_shutdown(&self) -> Result {
        info!("{}: system off", self.board.name());
        self.arch.firmware_call(FirmwareCall::SystemOff).map_err(|e| {
            error!("system off failed: {}", e);
            e
        })
    }
}
