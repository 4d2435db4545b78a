//! PL011 UART console driver

use crate::console::CharDevice;

/// QEMU virt PL011
pub const QEMU_VIRT_UART_BASE: usize = 0x0900_0000;

const UART_DR: usize = 0x00; // Data Register
const UART_FR: usize = 0x18; // Flag Register

const UART_FR_RXFE: u32 = 1 << 4; // Receive FIFO empty
const UART_FR_TXFF: u32 = 1 << 5; // Transmit FIFO full

pub struct Pl011 {
    name: &'static str,
    base: usize,
}

impl Pl011 {
    /// # Safety
    ///
    /// `base` must map a PL011 register window for the lifetime of the driver.
    pub const unsafe fn new(name: &'static str, base: usize) -> Self {
        Self { name, base }
    }

    pub fn putc(&self, c: u8) {
        while self.read_reg(UART_FR) & UART_FR_TXFF != 0 {}
        self.write_reg(UART_DR, c as u32);
    }

    pub fn getc(&self) -> Option<u8> {
        if self.read_reg(UART_FR) & UART_FR_RXFE != 0 {
            return None;
        }
        Some(self.read_reg(UART_DR) as u8)
    }

    #[inline]
    fn read_reg(&self, offset: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write_reg(&self, offset: usize, value: u32) {
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

impl CharDevice for Pl011 {
    fn name(&self) -> &str {
        self.name
    }

    fn write(&self, buf: &[u8]) -> usize {
        for &b in buf {
            if b == b'\n' {
                self.putc(b'\r');
            }
            self.putc(b);
        }
        buf.len()
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            match self.getc() {
                Some(c) => {
                    buf[n] = c;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Register window backed by memory: FR reads as "TX ready, RX empty"
    #[repr(C, align(4))]
    struct FakeRegs([u32; 16]);

    #[test]
    fn write_expands_newlines() {
        let mut regs = FakeRegs([0; 16]);
        regs.0[UART_FR / 4] = UART_FR_RXFE;
        let base = regs.0.as_mut_ptr() as usize;
        let uart = unsafe { Pl011::new("uart0", base) };
        assert_eq!(uart.write(b"a\n"), 2);
        // DR holds the last byte written.
        assert_eq!(regs.0[UART_DR / 4], b'\n' as u32);
        let mut buf = [0u8; 4];
        assert_eq!(uart.read(&mut buf), 0);
    }
}
