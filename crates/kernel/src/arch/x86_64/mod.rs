//! x86_64 backends for the hardware seams

pub mod serial;

use crate::hal::PortIo;
use x86_64::instructions::port::Port;

/// Real port I/O through in/out instructions
pub struct PortBus;

impl PortIo for PortBus {
    fn outb(&mut self, port: u16, val: u8) {
        unsafe { Port::<u8>::new(port).write(val) }
    }

    fn inb(&mut self, port: u16) -> u8 {
        unsafe { Port::<u8>::new(port).read() }
    }
}
