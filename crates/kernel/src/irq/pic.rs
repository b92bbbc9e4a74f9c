//! Legacy 8259A PIC (Programmable Interrupt Controller) driver
//!
//! The PC uses two 8259A PICs in a cascaded configuration: the master
//! handles IRQ 0-7, the slave handles IRQ 8-15 and is chained on the
//! master's IRQ 2 line. By default the PICs deliver IRQs on vectors 0-15,
//! which collide with CPU exceptions, so the first thing the kernel does is
//! remap them to vectors 32-47.
//!
//! The driver is generic over [`PortIo`] so the exact register protocol can
//! be exercised against an in-memory controller model in tests.

use crate::hal::PortIo;

/// Master PIC command port
pub const PIC1_COMMAND: u16 = 0x20;
/// Master PIC data port (IMR)
pub const PIC1_DATA: u16 = 0x21;
/// Slave PIC command port
pub const PIC2_COMMAND: u16 = 0xA0;
/// Slave PIC data port (IMR)
pub const PIC2_DATA: u16 = 0xA1;

/// End-of-interrupt command code
const PIC_EOI: u8 = 0x20;
/// OCW3: irq ready next CMD read
const PIC_READ_IRR: u8 = 0x0a;
/// OCW3: irq service next CMD read
const PIC_READ_ISR: u8 = 0x0b;

const ICW1_ICW4: u8 = 0x01; // ICW4 needed
const ICW1_INIT: u8 = 0x10; // Initialization - required!
const ICW4_8086: u8 = 0x01; // 8086/88 (MCS-80/85) mode

/// Vector offset the kernel remaps the master PIC to (IRQ 0-7 -> 32-39)
pub const IRQ_VECTOR_BASE: u8 = 32;
/// Vector offset for the slave PIC (IRQ 8-15 -> 40-47)
pub const IRQ_VECTOR_BASE2: u8 = IRQ_VECTOR_BASE + 8;

/// Chained 8259A pair, driven through a byte-port bus
pub struct Pic8259<B: PortIo> {
    bus: B,
}

impl<B: PortIo> Pic8259<B> {
    pub const fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Remap both PICs to the given vector offsets.
    ///
    /// Vectors on the master become `offset1..offset1+7`, on the slave
    /// `offset2..offset2+7`. The interrupt masks present before the
    /// initialization sequence are preserved.
    pub fn remap(&mut self, offset1: u8, offset2: u8) {
        let a1 = self.bus.inb(PIC1_DATA); // save masks
        let a2 = self.bus.inb(PIC2_DATA);

        // ICW1: start the initialization sequence (cascade mode)
        self.bus.outb(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        self.bus.io_wait();
        self.bus.outb(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        self.bus.io_wait();

        // ICW2: vector offsets
        self.bus.outb(PIC1_DATA, offset1);
        self.bus.io_wait();
        self.bus.outb(PIC2_DATA, offset2);
        self.bus.io_wait();

        // ICW3: master has a slave on IRQ2 (0000 0100); slave cascade
        // identity is 2 (0000 0010)
        self.bus.outb(PIC1_DATA, 0x04);
        self.bus.io_wait();
        self.bus.outb(PIC2_DATA, 0x02);
        self.bus.io_wait();

        // ICW4: 8086 mode
        self.bus.outb(PIC1_DATA, ICW4_8086);
        self.bus.io_wait();
        self.bus.outb(PIC2_DATA, ICW4_8086);
        self.bus.io_wait();

        // restore saved masks
        self.bus.outb(PIC1_DATA, a1);
        self.bus.outb(PIC2_DATA, a2);
    }

    /// Mask (disable) a specific IRQ line
    pub fn set_mask(&mut self, irq: u8) {
        debug_assert!(irq < 16);
        let (port, irq) = Self::line(irq);
        let mask = self.bus.inb(port);
        self.bus.outb(port, mask | (1 << irq));
    }

    /// Unmask (enable) a specific IRQ line
    pub fn clear_mask(&mut self, irq: u8) {
        debug_assert!(irq < 16);
        let (port, irq) = Self::line(irq);
        let mask = self.bus.inb(port);
        self.bus.outb(port, mask & !(1 << irq));
    }

    fn line(irq: u8) -> (u16, u8) {
        if irq < 8 {
            (PIC1_DATA, irq)
        } else {
            (PIC2_DATA, irq - 8)
        }
    }

    /// Acknowledge end-of-interrupt for `irq`.
    ///
    /// IRQs on the slave need an EOI on both chips; the master EOI is sent
    /// unconditionally, which also covers the cascade line.
    pub fn send_eoi(&mut self, irq: u8) {
        if irq >= 8 {
            self.bus.outb(PIC2_COMMAND, PIC_EOI);
        }

        self.bus.outb(PIC1_COMMAND, PIC_EOI);
    }

    /// Combined Interrupt Request Register: which IRQs have been raised
    pub fn read_irr(&mut self) -> u16 {
        self.read_irq_reg(PIC_READ_IRR)
    }

    /// Combined In-Service Register: which IRQs are being serviced
    pub fn read_isr(&mut self) -> u16 {
        self.read_irq_reg(PIC_READ_ISR)
    }

    /// Combined Interrupt Mask Register
    pub fn read_imr(&mut self) -> u16 {
        self.bus.inb(PIC1_DATA) as u16 | ((self.bus.inb(PIC2_DATA) as u16) << 8)
    }

    // OCW3 to both CMD ports, then read one byte back from each. PIC2 is
    // chained and represents IRQs 8-15; PIC1 is IRQs 0-7, with 2 being the
    // chain.
    fn read_irq_reg(&mut self, ocw3: u8) -> u16 {
        self.bus.outb(PIC1_COMMAND, ocw3);
        self.bus.outb(PIC2_COMMAND, ocw3);

        let mut result = self.bus.inb(PIC1_COMMAND) as u16;
        result |= (self.bus.inb(PIC2_COMMAND) as u16) << 8;
        result
    }
}
