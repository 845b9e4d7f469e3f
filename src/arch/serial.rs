//! COM1 16550 UART, used for the kernel log and as the console behind fd 1/2.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;
use x86_64::instructions::port::{Port, PortReadOnly, PortWriteOnly};

const COM1: u16 = 0x3F8;

// Register offsets from the port base.
const REG_DATA: u16 = 0;
const REG_INT_ENABLE: u16 = 1;
const REG_FIFO: u16 = 2;
const REG_LINE_CONTROL: u16 = 3;
const REG_MODEM_CONTROL: u16 = 4;
const REG_LINE_STATUS: u16 = 5;

const LINE_DLAB: u8 = 0x80;
const LINE_8N1: u8 = 0x03;
const STATUS_THR_EMPTY: u8 = 0x20;

/// 115200 / 3 = 38400 baud.
const BAUD_DIVISOR: u16 = 3;

pub struct Uart {
    base: u16,
    data: Port<u8>,
    status: PortReadOnly<u8>,
}

impl Uart {
    /// # Safety
    /// `base` must be the I/O base of a 16550-compatible UART.
    pub unsafe fn new(base: u16) -> Self {
        Uart {
            base,
            data: Port::new(base + REG_DATA),
            status: PortReadOnly::new(base + REG_LINE_STATUS),
        }
    }

    unsafe fn set(&self, reg: u16, value: u8) {
        PortWriteOnly::<u8>::new(self.base + reg).write(value);
    }

    /// Polled mode: UART interrupts stay off.
    pub fn init(&mut self) {
        unsafe {
            self.set(REG_INT_ENABLE, 0);
            self.set(REG_LINE_CONTROL, LINE_DLAB);
            self.set(REG_DATA, (BAUD_DIVISOR & 0xff) as u8);
            self.set(REG_INT_ENABLE, (BAUD_DIVISOR >> 8) as u8);
            self.set(REG_LINE_CONTROL, LINE_8N1);
            self.set(REG_FIFO, 0xC7);
            self.set(REG_MODEM_CONTROL, 0x0B);
        }
    }

    fn put(&mut self, byte: u8) {
        while unsafe { self.status.read() } & STATUS_THR_EMPTY == 0 {
            core::hint::spin_loop();
        }
        unsafe { self.data.write(byte) }
    }

    /// Terminals expect CRLF.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                self.put(b'\r');
            }
            self.put(byte);
        }
    }
}

impl fmt::Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_raw(s.as_bytes());
        Ok(())
    }
}

lazy_static! {
    pub static ref COM1_UART: Mutex<Uart> = {
        let mut uart = unsafe { Uart::new(COM1) };
        uart.init();
        Mutex::new(uart)
    };
}

/// Output of user `write` calls.
pub fn write_bytes(bytes: &[u8]) {
    without_interrupts(|| COM1_UART.lock().write_raw(bytes));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    without_interrupts(|| {
        let _ = COM1_UART.lock().write_fmt(args);
    });
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::arch::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(concat!($fmt, "\n"), $($arg)*));
}
