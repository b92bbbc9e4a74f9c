//! Kernel reader/writer lock with explicit, un-scoped operations
//!
//! The VFS lock hooks (`fs_shlock`/`fs_shunlock`/`exlock`/...) are plain
//! vtable calls that may be held across other calls, so this lock exposes
//! lock/unlock as separate operations instead of RAII guards. Writers are
//! preferred: once a writer is waiting, new readers are held back.

use core::sync::atomic::{AtomicU32, Ordering};

const WRITER: u32 = 1 << 31;
const WRITER_PENDING: u32 = 1 << 30;
const READER_MASK: u32 = WRITER_PENDING - 1;

pub struct KRwLock {
    state: AtomicU32,
}

impl KRwLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    pub fn shlock(&self) {
        loop {
            let s = self.state.load(Ordering::Acquire);

            if s & (WRITER | WRITER_PENDING) == 0 {
                if self
                    .state
                    .compare_exchange_weak(s, s + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }

            core::hint::spin_loop();
        }
    }

    pub fn try_shlock(&self) -> bool {
        let s = self.state.load(Ordering::Acquire);
        s & (WRITER | WRITER_PENDING) == 0
            && self
                .state
                .compare_exchange(s, s + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
    }

    pub fn shunlock(&self) {
        let prev = self.state.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & READER_MASK > 0, "shunlock without readers");
    }

    pub fn exlock(&self) {
        loop {
            let s = self.state.load(Ordering::Acquire);

            if s & WRITER == 0 && s & READER_MASK == 0 {
                if self
                    .state
                    .compare_exchange_weak(s, WRITER, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            } else if s & WRITER_PENDING == 0 {
                // hold back new readers while this writer waits
                self.state.fetch_or(WRITER_PENDING, Ordering::AcqRel);
            }

            core::hint::spin_loop();
        }
    }

    pub fn try_exlock(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn exunlock(&self) {
        let prev = self.state.swap(0, Ordering::Release);
        debug_assert!(prev & WRITER != 0, "exunlock without writer");
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & WRITER != 0
    }

    pub fn reader_count(&self) -> u32 {
        self.state.load(Ordering::Acquire) & READER_MASK
    }
}

impl Default for KRwLock {
    fn default() -> Self {
        Self::new()
    }
}
