//! Clocksources and the 64-bit nanosecond timecounter layered on them.

use alloc::sync::Arc;

use log::info;
use spin::RwLock;

use crate::arch::traits::ClockSource;
use crate::sync::IrqSpinLock;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_USEC: u64 = 1_000;

/// Conversion factors for `to = (from * mult) >> shift`
///
/// `maxsec` bounds the conversion range: a `from`-rate input worth
/// `maxsec` seconds must not overflow 64 bits once multiplied.
pub fn calc_mult_shift(from: u64, to: u64, maxsec: u64) -> (u32, u32) {
    let mut sftacc: u32 = 32;
    let mut tmp = (maxsec * from) >> 32;
    while tmp != 0 {
        tmp >>= 1;
        sftacc -= 1;
    }

    let mut mult = 0u64;
    let mut shift = 32;
    while shift > 0 {
        mult = ((to << shift) + from / 2) / from;
        if mult >> sftacc == 0 {
            break;
        }
        shift -= 1;
    }
    (mult as u32, shift)
}

#[inline]
pub fn cyc2ns(cycles: u64, mult: u32, shift: u32) -> u64 {
    ((cycles as u128 * mult as u128) >> shift) as u64
}

/// ns -> cycles, rounded up so that a deadline is never reached early
#[inline]
pub fn ns2cyc_ceil(ns: u64, mult: u32, shift: u32) -> u64 {
    let prod = ns as u128 * mult as u128;
    let round = (1u128 << shift) - 1;
    ((prod + round) >> shift) as u64
}

/// Extends a possibly narrow counter into monotonic nanoseconds
#[derive(Clone, Copy, Debug)]
pub struct TimeCounter {
    cycle_last: u64,
    nsec: u64,
    /// Sub-nanosecond remainder, in units of `2^-shift` ns
    frac: u64,
    mask: u64,
    mult: u32,
    shift: u32,
}

impl TimeCounter {
    pub fn new(cs: &dyn ClockSource, start_ns: u64) -> Self {
        Self {
            cycle_last: cs.read() & cs.mask(),
            nsec: start_ns,
            frac: 0,
            mask: cs.mask(),
            mult: cs.mult(),
            shift: cs.shift(),
        }
    }

    /// Fold the cycles elapsed since the last read into the ns total
    ///
    /// Must be called at least once per wrap period of the counter.
    pub fn read(&mut self, cs: &dyn ClockSource) -> u64 {
        let now = cs.read() & self.mask;
        let delta = now.wrapping_sub(self.cycle_last) & self.mask;
        self.cycle_last = now;
        let total = delta as u128 * self.mult as u128 + self.frac as u128;
        self.nsec += (total >> self.shift) as u64;
        self.frac = (total & ((1u128 << self.shift) - 1)) as u64;
        self.nsec
    }

    /// Half of the counter's wrap period, `None` for full 64-bit counters
    pub fn refresh_period_ns(&self) -> Option<u64> {
        if self.mask == u64::MAX {
            None
        } else {
            Some((cyc2ns(self.mask, self.mult, self.shift) / 2).max(1))
        }
    }
}

struct ActiveSource {
    cs: Arc<dyn ClockSource>,
    tc: TimeCounter,
}

/// Host time: the best registered clocksource behind a timecounter
pub struct Clock {
    active: IrqSpinLock<Option<ActiveSource>>,
    sources: RwLock<alloc::vec::Vec<Arc<dyn ClockSource>>>,
}

impl Clock {
    pub const fn new() -> Self {
        Self {
            active: IrqSpinLock::new(None),
            sources: RwLock::new(alloc::vec::Vec::new()),
        }
    }

    /// Add a source; returns true if it became the active one
    pub fn register(&self, cs: Arc<dyn ClockSource>) -> bool {
        self.sources.write().push(cs.clone());
        let mut active = self.active.lock();
        let better = match active.as_ref() {
            None => true,
            Some(cur) => cs.rating() > cur.cs.rating(),
        };
        if better {
            let now = match active.as_mut() {
                Some(cur) => cur.tc.read(cur.cs.as_ref()),
                None => 0,
            };
            info!("clocksource: switching to {} (rating {})", cs.name(), cs.rating());
            let tc = TimeCounter::new(cs.as_ref(), now);
            *active = Some(ActiveSource { cs, tc });
        }
        better
    }

    /// Monotonic ns since the first clocksource was registered
    pub fn timestamp(&self) -> u64 {
        match self.active.lock().as_mut() {
            Some(a) => a.tc.read(a.cs.as_ref()),
            None => 0,
        }
    }

    pub fn refresh_period_ns(&self) -> Option<u64> {
        self.active.lock().as_ref().and_then(|a| a.tc.refresh_period_ns())
    }

    pub fn source_name(&self) -> Option<alloc::string::String> {
        self.active
            .lock()
            .as_ref()
            .map(|a| alloc::string::String::from(a.cs.name()))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
