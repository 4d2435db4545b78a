//! Boot command line
//!
//! `key=value` tokens separated by whitespace, each handed to the early
//! parameter whose key matches. Unknown keys are skipped.

use core::str::FromStr;

use log::{debug, warn, LevelFilter};

use crate::config::VmmConfig;
use crate::error::{Error, Result};
use crate::vcpu::MAX_PRIORITY;

pub struct EarlyParam {
    pub key: &'static str,
    pub setup: fn(&mut VmmConfig, &str) -> Result,
}

pub static EARLY_PARAMS: &[EarlyParam] = &[
    EarlyParam { key: "loglevel", setup: setup_loglevel },
    EarlyParam { key: "sched.tick_ns", setup: setup_sched_tick },
    EarlyParam { key: "vmm.mterm_prio", setup: setup_mterm_prio },
];

/// Split a command line into `(key, value)` pairs; a bare key has value `""`
pub fn tokens(cmdline: &str) -> impl Iterator<Item = (&str, &str)> {
    cmdline
        .split_whitespace()
        .map(|tok| tok.split_once('=').unwrap_or((tok, "")))
}

/// Run `params` over `cmdline`; returns how many tokens were consumed
pub fn parse_with(params: &[EarlyParam], cmdline: &str, config: &mut VmmConfig) -> usize {
    let mut handled = 0;
    for (key, value) in tokens(cmdline) {
        let Some(param) = params.iter().find(|p| p.key == key) else {
            debug!("cmdline: ignoring {}", key);
            continue;
        };
        match (param.setup)(config, value) {
            Ok(()) => handled += 1,
            Err(e) => warn!("cmdline: {}={}: {}", key, value, e),
        }
    }
    handled
}

/// Apply the built-in parameters to `config.bootargs`
pub fn apply(config: &mut VmmConfig) -> usize {
    let bootargs = core::mem::take(&mut config.bootargs);
    let handled = parse_with(EARLY_PARAMS, &bootargs, config);
    config.bootargs = bootargs;
    handled
}

fn setup_loglevel(config: &mut VmmConfig, value: &str) -> Result {
    let level = match value.parse::<u8>() {
        Ok(0) => LevelFilter::Off,
        Ok(1) => LevelFilter::Error,
        Ok(2) => LevelFilter::Warn,
        Ok(3) => LevelFilter::Info,
        Ok(4) => LevelFilter::Debug,
        Ok(_) => LevelFilter::Trace,
        Err(_) => LevelFilter::from_str(value).map_err(|_| Error::Invalid)?,
    };
    config.log_level = Some(level);
    Ok(())
}

fn setup_sched_tick(config: &mut VmmConfig, value: &str) -> Result {
    let ns = parse_u64(value)?;
    if ns == 0 {
        return Err(Error::Invalid);
    }
    config.sched_tick_ns = ns;
    Ok(())
}

fn setup_mterm_prio(config: &mut VmmConfig, value: &str) -> Result {
    let prio = parse_u64(value)?;
    if prio == 0 || prio > MAX_PRIORITY as u64 {
        return Err(Error::Invalid);
    }
    config.mterm_priority = prio as u8;
    Ok(())
}

/// Decimal or `0x`-prefixed hexadecimal
pub fn parse_u64(value: &str) -> Result<u64> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| Error::Invalid)
}
