// Kernel logging (printk) with ring buffer

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Global log level (default: INFO)
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

/// Console back-end for immediate output (serial on x86_64, capture in tests)
pub trait Console: Send + Sync {
    fn write_str(&self, s: &str);
}

static CONSOLE: Mutex<Option<&'static dyn Console>> = Mutex::new(None);

pub fn set_console(console: &'static dyn Console) {
    *CONSOLE.lock() = Some(console);
}

#[derive(Copy, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: [u8; 128],
    pub len: usize,
}

impl LogEntry {
    pub fn text(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<bad utf8>")
    }
}

const LOG_RING_SIZE: usize = 256;

struct LogRing {
    entries: [Option<LogEntry>; LOG_RING_SIZE],
    head: usize,
}

static KERNEL_LOG: Mutex<LogRing> = Mutex::new(LogRing {
    entries: [None; LOG_RING_SIZE],
    head: 0,
});

pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }

    let msg = alloc::format!("{}", args);

    let mut message = [0u8; 128];
    let len = core::cmp::min(msg.len(), 128);
    message[..len].copy_from_slice(&msg.as_bytes()[..len]);

    {
        let mut ring = KERNEL_LOG.lock();
        let head = ring.head;
        ring.entries[head] = Some(LogEntry { level, message, len });
        ring.head = (head + 1) % LOG_RING_SIZE;
    }

    if let Some(console) = *CONSOLE.lock() {
        console.write_str("[");
        console.write_str(level.as_str());
        console.write_str("] ");
        console.write_str(&msg);
        console.write_str("\n");
    }
}

/// Copy out the buffered entries, oldest first
pub fn drain_all() -> alloc::vec::Vec<LogEntry> {
    let mut ring = KERNEL_LOG.lock();
    let mut out = alloc::vec::Vec::new();
    let head = ring.head;

    for i in 0..LOG_RING_SIZE {
        if let Some(e) = ring.entries[(head + i) % LOG_RING_SIZE].take() {
            out.push(e);
        }
    }

    ring.head = 0;
    out
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::printk::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::printk::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::printk::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::printk::LogLevel::Debug, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_keeps_messages() {
        log(LogLevel::Error, format_args!("hello {}", 42));
        let entries = drain_all();
        assert!(entries.iter().any(|e| e.text() == "hello 42"));
    }

    #[test]
    fn test_level_filter() {
        set_level(LogLevel::Error);
        assert!(!is_enabled(LogLevel::Debug));
        assert!(is_enabled(LogLevel::Error));
        set_level(LogLevel::Info);
    }
}
