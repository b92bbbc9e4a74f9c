// Kernel synchronization primitives

pub mod kmutex;
pub mod rwlock;

pub use kmutex::{KMutex, KMutexFlags};
pub use rwlock::KRwLock;
