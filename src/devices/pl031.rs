/// Virtual RTC (PL031) emulator
///
/// Seconds count from the hypervisor timestamp. A match interrupt is
/// delivered through a one-shot timer event that asserts the device's
/// virtual IRQ on the guest's boot VCPU.
///
/// Register map:
///   0x000 RTCDR   - Data Register (read-only, current time in seconds)
///   0x004 RTCMR   - Match Register
///   0x008 RTCLR   - Load Register (sets the epoch)
///   0x00C RTCCR   - Control Register (bit 0 = enable, default 1)
///   0x010 RTCIMSC - Interrupt Mask Set/Clear
///   0x014 RTCRIS  - Raw Interrupt Status
///   0x018 RTCMIS  - Masked Interrupt Status
///   0x01C RTCICR  - Interrupt Clear Register
///   0xFE0-0xFFC   - PrimeCell identification registers
use alloc::boxed::Box;
use alloc::sync::Arc;

use log::warn;

use super::{EmuContext, EmuDeviceInfo, EmulatedDevice, Emulator, Endian};
use crate::clocksource::NSEC_PER_SEC;
use crate::error::{Error, Result};
use crate::guest::GuestId;
use crate::hypervisor::Hypervisor;
use crate::timer::{TimerAction, TimerEventId};

const RTCDR: u64 = 0x000;
const RTCMR: u64 = 0x004;
const RTCLR: u64 = 0x008;
const RTCCR: u64 = 0x00C;
const RTCIMSC: u64 = 0x010;
const RTCRIS: u64 = 0x014;
const RTCMIS: u64 = 0x018;
const RTCICR: u64 = 0x01C;

const PERIPHID0: u64 = 0xFE0;
const PERIPHID1: u64 = 0xFE4;
const PERIPHID2: u64 = 0xFE8;
const PERIPHID3: u64 = 0xFEC;
const PCELLID0: u64 = 0xFF0;
const PCELLID1: u64 = 0xFF4;
const PCELLID2: u64 = 0xFF8;
const PCELLID3: u64 = 0xFFC;

pub struct Pl031Emulator;

impl Emulator for Pl031Emulator {
    fn name(&self) -> &str {
        "pl031"
    }

    fn compatible(&self) -> &[&str] {
        &["arm,pl031", "primecell"]
    }

    fn endian(&self) -> Endian {
        Endian::Little
    }

    fn probe(&self, ctx: &EmuContext, info: &EmuDeviceInfo) -> Result<Box<dyn EmulatedDevice>> {
        let match_event = match info.irq {
            Some(irq) => Some(match_timer(ctx, irq)?),
            None => None,
        };
        Ok(Box::new(VirtualPl031 {
            load_value: 0,
            load_tstamp: ctx.timestamp(),
            match_value: 0,
            control: 1,
            imsc: 0,
            ris: 0,
            irq: info.irq,
            match_event,
        }))
    }
}

fn match_timer(ctx: &EmuContext, irq: u32) -> Result<TimerEventId> {
    let guest: GuestId = ctx.guest();
    let action = TimerAction::Callback(Arc::new(move |hv: &Hypervisor, _ev: TimerEventId| {
        let ctx = EmuContext::new(hv, guest, None);
        if let Err(e) = ctx.irq_assert(irq, 0) {
            warn!("pl031: match irq {} not delivered: {}", irq, e);
        }
    }));
    ctx.hv().timer_event_create("pl031-match", 0, action)
}

/// Tracks a load value (epoch seconds) and the timestamp at which it was
/// set; RTCDR returns `load_value + elapsed_seconds`.
struct VirtualPl031 {
    load_value: u64,
    load_tstamp: u64,
    match_value: u32,
    /// bit 0 = RTC enabled
    control: u32,
    imsc: u32,
    ris: u32,
    irq: Option<u32>,
    match_event: Option<TimerEventId>,
}

impl VirtualPl031 {
    fn current_time(&self, now: u64) -> u64 {
        if self.control & 1 == 0 {
            return self.load_value;
        }
        self.load_value + now.saturating_sub(self.load_tstamp) / NSEC_PER_SEC
    }

    fn update_match(&mut self, ctx: &EmuContext) -> Result {
        let Some(ev) = self.match_event else {
            return Ok(());
        };
        let now = ctx.timestamp();
        let current = self.current_time(now);
        let target = self.match_value as u64;
        if self.imsc & 1 == 0 || self.control & 1 == 0 || target < current {
            return ctx.hv().timer_event_stop(ev);
        }
        if target == current {
            self.ris |= 1;
            return ctx.hv().timer_event_expire(ev);
        }
        // Seconds tick over at whole multiples since the load.
        let elapsed = now.saturating_sub(self.load_tstamp);
        let next_second = NSEC_PER_SEC - elapsed % NSEC_PER_SEC;
        let delay = next_second + (target - current - 1) * NSEC_PER_SEC;
        ctx.hv().timer_event_start(ev, delay)
    }
}

impl EmulatedDevice for VirtualPl031 {
    fn reset(&mut self, ctx: &EmuContext) -> Result {
        self.load_value = 0;
        self.load_tstamp = ctx.timestamp();
        self.match_value = 0;
        self.control = 1;
        self.imsc = 0;
        self.ris = 0;
        if let Some(ev) = self.match_event {
            ctx.hv().timer_event_stop(ev)?;
        }
        Ok(())
    }

    fn read(&mut self, ctx: &EmuContext, offset: u64, size: u8) -> Result<u64> {
        if size != 4 {
            return Err(Error::Invalid);
        }
        let now = ctx.timestamp();
        if self.imsc & 1 != 0 && self.current_time(now) >= self.match_value as u64 {
            self.ris |= 1;
        }
        let value = match offset {
            RTCDR => self.current_time(now) & 0xFFFF_FFFF,
            RTCMR => self.match_value as u64,
            RTCCR => self.control as u64,
            RTCIMSC => self.imsc as u64,
            RTCRIS => self.ris as u64,
            RTCMIS => (self.ris & self.imsc) as u64,
            RTCLR | RTCICR => 0,

            // Peripheral ID, required by the Linux amba-pl031 probe
            PERIPHID0 => 0x31,
            PERIPHID1 => 0x10,
            PERIPHID2 => 0x04,
            PERIPHID3 => 0x00,
            PCELLID0 => 0x0D,
            PCELLID1 => 0xF0,
            PCELLID2 => 0x05,
            PCELLID3 => 0xB1,

            _ => 0,
        };
        Ok(value)
    }

    fn write(&mut self, ctx: &EmuContext, offset: u64, value: u64, size: u8, _mask: u64) -> Result {
        if size != 4 {
            return Err(Error::Invalid);
        }
        match offset {
            RTCMR => {
                self.match_value = value as u32;
                self.update_match(ctx)?;
            }
            RTCLR => {
                self.load_value = value & 0xFFFF_FFFF;
                self.load_tstamp = ctx.timestamp();
                self.update_match(ctx)?;
            }
            RTCCR => {
                self.control = (value & 1) as u32;
                self.update_match(ctx)?;
            }
            RTCIMSC => {
                self.imsc = (value & 1) as u32;
                self.update_match(ctx)?;
            }
            RTCICR => {
                self.ris &= !(value as u32);
                if let Some(irq) = self.irq {
                    ctx.irq_deassert(irq)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn remove(&mut self, ctx: &EmuContext) {
        if let Some(ev) = self.match_event.take() {
            let _ = ctx.hv().timer_event_destroy(ev);
        }
    }
}
