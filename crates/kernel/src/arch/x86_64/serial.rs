//! COM1 console back-end for printk

use crate::printk::Console;
use spin::Mutex;
use uart_16550::SerialPort;

const COM1: u16 = 0x3F8;

pub struct SerialConsole {
    port: Mutex<SerialPort>,
}

impl SerialConsole {
    /// # Safety
    ///
    /// `COM1` must be a real 16550-compatible UART on this machine.
    pub const unsafe fn new() -> Self {
        Self {
            port: Mutex::new(unsafe { SerialPort::new(COM1) }),
        }
    }
}

impl Console for SerialConsole {
    fn write_str(&self, s: &str) {
        let mut port = self.port.lock();
        for b in s.bytes() {
            port.send(b);
        }
    }
}

static SERIAL: SerialConsole = unsafe { SerialConsole::new() };

/// Route printk output to COM1. Called once during early bring-up.
pub fn init() {
    SERIAL.port.lock().init();
    crate::printk::set_console(&SERIAL);
}
