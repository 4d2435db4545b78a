//! Console output and the `log` backend
//!
//! Output goes to one character device. Until a device is registered
//! everything written is dropped.

use alloc::sync::Arc;
use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::RwLock;

use crate::error::Result;
use crate::hypervisor::Hypervisor;

/// Class under which console-capable devices are registered
pub const CHARDEV_CLASS: &str = "chardev";

/// Byte-oriented device such as a UART
pub trait CharDevice: Send + Sync {
    fn name(&self) -> &str;
    /// Returns the number of bytes accepted
    fn write(&self, buf: &[u8]) -> usize;
    /// Non-blocking; returns the number of bytes read
    fn read(&self, _buf: &mut [u8]) -> usize {
        0
    }
}

static CONSOLE: RwLock<Option<Arc<dyn CharDevice>>> = RwLock::new(None);

pub fn set_console(dev: Arc<dyn CharDevice>) {
    *CONSOLE.write() = Some(dev);
}

pub fn console_name() -> Option<alloc::string::String> {
    CONSOLE.read().as_ref().map(|d| alloc::string::String::from(d.name()))
}

pub fn puts(s: &str) {
    if let Some(dev) = CONSOLE.read().as_ref() {
        let mut buf = s.as_bytes();
        while !buf.is_empty() {
            let n = dev.write(buf);
            if n == 0 {
                break;
            }
            buf = &buf[n..];
        }
    }
}

/// Read whatever input the console has buffered
pub fn gets(buf: &mut [u8]) -> usize {
    CONSOLE.read().as_ref().map_or(0, |dev| dev.read(buf))
}

pub struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        puts(s);
        Ok(())
    }
}

pub fn writer() -> ConsoleWriter {
    ConsoleWriter
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = write!($crate::console::writer(), $($arg)*);
    }};
}

#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {{
        use core::fmt::Write;
        let _ = writeln!($crate::console::writer(), $($arg)*);
    }};
}

pub struct ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = writeln!(
            ConsoleWriter,
            "[{:<5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Install the console logger. Later calls only change the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

impl Hypervisor {
    /// Register `dev` as a character device and make it the console
    pub fn console_register(&self, dev: Arc<dyn CharDevice>) -> Result {
        self.classes
            .register_device(CHARDEV_CLASS, dev.name(), Arc::new(dev.clone()))?;
        set_console(dev);
        Ok(())
    }

    pub fn chardev_find(&self, name: &str) -> Option<Arc<dyn CharDevice>> {
        self.classes
            .find::<Arc<dyn CharDevice>>(CHARDEV_CLASS, name)
            .map(|d| (*d).clone())
    }
}
