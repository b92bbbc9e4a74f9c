//! Hardware IRQ dispatch
//!
//! Converts an interrupt entry (saved register snapshot + encoded vector)
//! into a call to the registered handler, while acknowledging the PIC in
//! the narrow correct window and preserving the nested-interrupt and
//! preemption invariants.
//!
//! The epilogue bookkeeping is factored into three scoped guards, each with
//! a single release path: [`MaskGuard`] (line mask), [`PreemptGuard`]
//! (preemption counter), [`NestedIrqGuard`] (vector stack).

pub mod pic;

use crate::hal::PortIo;
use crate::sched::{Regs, Scheduler};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use pic::Pic8259;
use spin::Mutex;

pub use pic::{IRQ_VECTOR_BASE, IRQ_VECTOR_BASE2};

/// Hardware IRQ lines behind the cascaded pair
pub const IRQ_COUNT: usize = 16;
/// Interrupt vector space
pub const VECTOR_COUNT: usize = 256;

/// A registered IRQ handler.
///
/// The return value is the "bottom half requested" flag: `true` asks the
/// dispatcher to hand off to the scheduler once the IRQ epilogue is done
/// and preemption is safe.
pub trait IrqHandler: Send + Sync {
    fn handle(&self, regs: &mut Regs) -> bool;
}

pub struct IrqDispatcher<B: PortIo> {
    pic: Mutex<Pic8259<B>>,
    handlers: Mutex<[Option<&'static dyn IrqHandler>; IRQ_COUNT]>,
    unhandled_irq_count: [AtomicU32; VECTOR_COUNT],
    spur_irq_count: AtomicU32,
    /// Shadow of the CPU interrupt flag. The arch entry stubs keep the real
    /// flag in sync with this; the dispatcher only asserts and flips the
    /// shadow.
    interrupts_enabled: AtomicBool,
}

impl<B: PortIo> IrqDispatcher<B> {
    pub fn new(pic: Pic8259<B>) -> Self {
        Self {
            pic: Mutex::new(pic),
            handlers: Mutex::new([None; IRQ_COUNT]),
            unhandled_irq_count: core::array::from_fn(|_| AtomicU32::new(0)),
            spur_irq_count: AtomicU32::new(0),
            interrupts_enabled: AtomicBool::new(true),
        }
    }

    /// Remap the PIC pair to the kernel vector bases and mask every line.
    /// Lines are unmasked one by one as handlers are installed.
    pub fn init(&self) {
        let mut pic = self.pic.lock();
        pic.remap(IRQ_VECTOR_BASE, IRQ_VECTOR_BASE2);

        for irq in 0..IRQ_COUNT as u8 {
            pic.set_mask(irq);
        }

        drop(pic);
        info!(
            "irq: PIC remapped, IRQ 0-15 -> vectors {}-{}",
            IRQ_VECTOR_BASE,
            IRQ_VECTOR_BASE2 + 7
        );
    }

    /// Install a handler for the given IRQ and unmask its line
    pub fn install(&self, irq: u8, handler: &'static dyn IrqHandler) {
        debug_assert!((irq as usize) < IRQ_COUNT);
        self.handlers.lock()[irq as usize] = Some(handler);
        self.pic.lock().clear_mask(irq);
    }

    /// Clear the handler slot. The mask state of the line is left untouched.
    pub fn uninstall(&self, irq: u8) {
        debug_assert!((irq as usize) < IRQ_COUNT);
        self.handlers.lock()[irq as usize] = None;
    }

    pub fn handler_installed(&self, irq: u8) -> bool {
        self.handlers.lock()[irq as usize].is_some()
    }

    pub fn spur_irq_count(&self) -> u32 {
        self.spur_irq_count.load(Ordering::SeqCst)
    }

    pub fn unhandled_count(&self, vector: u32) -> u32 {
        self.unhandled_irq_count[vector as usize].load(Ordering::SeqCst)
    }

    pub fn are_interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }

    /// Dispatch a hardware interrupt entry.
    ///
    /// Called with the vector encoded in `regs.int_num`; the interrupt gate
    /// has already cleared the interrupt flag.
    pub fn handle_irq(&self, sched: &Scheduler, regs: &mut Regs) {
        let vector = regs.int_num;
        debug_assert!(
            vector >= IRQ_VECTOR_BASE as u32 && vector < IRQ_VECTOR_BASE as u32 + 16
        );
        let irq = (vector - IRQ_VECTOR_BASE as u32) as u8;

        self.interrupts_enabled.store(false, Ordering::SeqCst);

        if irq == 7 || irq == 15 {
            // Spurious wake-up check. The PIC raises its lowest-priority
            // vector when the request disappears between INTR and the
            // vector cycle; in that case the ISR flag for the line is NOT
            // set and no EOI must be sent, EXCEPT that a spurious IRQ 15
            // still needs an EOI on the master for the cascade line. The
            // ISR test has to come before any EOI.
            if self.pic.lock().read_isr() & (1 << irq) == 0 {
                if irq == 15 {
                    self.pic.lock().send_eoi(7);
                }

                self.spur_irq_count.fetch_add(1, Ordering::SeqCst);
                self.interrupts_enabled.store(true, Ordering::SeqCst);
                return;
            }
        }

        let bottom_half = {
            let _mask = MaskGuard::new(&self.pic, irq);
            let _preempt = PreemptGuard::new(sched);
            let _nested = NestedIrqGuard::new(sched, vector);
            debug_assert!(!self.are_interrupts_enabled());

            // EOI must reach the PIC before interrupts are re-enabled,
            // otherwise its gated nested-interrupt latch starts issuing
            // spurious interrupts.
            self.pic.lock().send_eoi(irq);
            self.interrupts_enabled.store(true, Ordering::SeqCst);

            let handler = self.handlers.lock()[irq as usize];
            match handler {
                Some(h) => h.handle(regs),
                None => {
                    self.unhandled_irq_count[vector as usize].fetch_add(1, Ordering::SeqCst);
                    false
                }
            }
        };

        if !bottom_half {
            return;
        }

        sched.disable_preemption();

        if sched.preemption_count() > 1 {
            // Preemption was already disabled at handler exit: the bottom
            // half cannot run now. Restore the counter; the scheduler will
            // take it up as soon as possible.
            sched.enable_preemption();
            return;
        }

        sched.save_current_task_state(regs);

        // The nested interrupt has been popped above, so this call runs
        // outside interrupt context.
        sched.schedule_outside_interrupt_context();

        sched.enable_preemption();
    }
}

/// True when the given line stays unmasked during its own handler.
///
/// Nested IRQ 0 is allowed only when nested interrupts are tracked,
/// otherwise the timer handler cannot know it is running re-entered.
fn line_stays_unmasked(irq: u8) -> bool {
    cfg!(feature = "track-nested-irqs") && irq == 0
}

/// Masks the dispatched line for the duration of its handler
struct MaskGuard<'a, B: PortIo> {
    pic: &'a Mutex<Pic8259<B>>,
    irq: u8,
}

impl<'a, B: PortIo> MaskGuard<'a, B> {
    fn new(pic: &'a Mutex<Pic8259<B>>, irq: u8) -> Self {
        if !line_stays_unmasked(irq) {
            pic.lock().set_mask(irq);
        }
        Self { pic, irq }
    }
}

impl<B: PortIo> Drop for MaskGuard<'_, B> {
    fn drop(&mut self) {
        if !line_stays_unmasked(self.irq) {
            self.pic.lock().clear_mask(self.irq);
        }
    }
}

/// Holds preemption disabled
struct PreemptGuard<'a> {
    sched: &'a Scheduler,
}

impl<'a> PreemptGuard<'a> {
    fn new(sched: &'a Scheduler) -> Self {
        sched.disable_preemption();
        Self { sched }
    }
}

impl Drop for PreemptGuard<'_> {
    fn drop(&mut self) {
        self.sched.enable_preemption();
    }
}

/// Keeps the vector on the nested-interrupt stack
struct NestedIrqGuard<'a> {
    sched: &'a Scheduler,
}

impl<'a> NestedIrqGuard<'a> {
    fn new(sched: &'a Scheduler, vector: u32) -> Self {
        sched.push_nested_interrupt(vector);
        Self { sched }
    }
}

impl Drop for NestedIrqGuard<'_> {
    fn drop(&mut self) {
        self.sched.pop_nested_interrupt();
    }
}
