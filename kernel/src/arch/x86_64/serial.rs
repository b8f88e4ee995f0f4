//! Serial Console (UART 16550)
//!
//! Kernel log output via COM1.

use super::{inb, outb};
use core::fmt::{self, Write};
use spin::Mutex;

/// COM1 port address
const COM1: u16 = 0x3F8;

/// Serial port
pub struct SerialPort {
    port: u16,
}

impl SerialPort {
    /// Create new serial port
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// Program 115200 8N1 with FIFOs
    pub fn init(&mut self) {
        unsafe {
            outb(self.port + 1, 0x00);
            // DLAB on, divisor 1
            outb(self.port + 3, 0x80);
            outb(self.port, 0x01);
            outb(self.port + 1, 0x00);
            outb(self.port + 3, 0x03);
            outb(self.port + 2, 0xC7);
            outb(self.port + 4, 0x0B);

            // Loopback self-test
            outb(self.port + 4, 0x1E);
            outb(self.port, 0xAE);
            if inb(self.port) != 0xAE {
                return;
            }
            outb(self.port + 4, 0x0F);
        }
    }

    fn is_transmit_empty(&self) -> bool {
        unsafe { inb(self.port + 5) & 0x20 != 0 }
    }

    /// Write a byte
    pub fn write_byte(&mut self, byte: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe { outb(self.port, byte) }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

/// Initialize serial port
pub fn init() {
    SERIAL.lock().init();
}

/// Print to serial port
pub fn print(args: fmt::Arguments) {
    let _ = SERIAL.lock().write_fmt(args);
}

/// Logger writing to COM1
pub struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            print(format_args!(
                "[{:5}] {}:{}: {}\n",
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Initialize logger; later calls are ignored
pub fn init_logger(level: log::LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
