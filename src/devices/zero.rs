//! Reads-as-zero, writes-ignored device

use alloc::boxed::Box;

use super::{EmuContext, EmuDeviceInfo, EmulatedDevice, Emulator, Endian};
use crate::error::Result;

pub struct ZeroEmulator;

impl Emulator for ZeroEmulator {
    fn name(&self) -> &str {
        "zero"
    }

    fn compatible(&self) -> &[&str] {
        &["zero"]
    }

    fn endian(&self) -> Endian {
        Endian::Native
    }

    fn probe(&self, _ctx: &EmuContext, _info: &EmuDeviceInfo) -> Result<Box<dyn EmulatedDevice>> {
        Ok(Box::new(ZeroDevice))
    }
}

struct ZeroDevice;

impl EmulatedDevice for ZeroDevice {
    fn read(&mut self, _ctx: &EmuContext, _offset: u64, _size: u8) -> Result<u64> {
        Ok(0)
    }

    fn write(&mut self, _ctx: &EmuContext, _offset: u64, _value: u64, _size: u8, _mask: u64) -> Result {
        Ok(())
    }
}
