//! Blocking kernel mutex
//!
//! Integrates with the scheduler's wait-object protocol: a contended lock
//! puts the calling task to sleep, and unlock transfers ownership to the
//! first task in the sleeping list waiting on this mutex. The wake policy
//! is list order, not strictly FIFO.
//!
//! Must not be used from IRQ handlers: mutex operations may suspend the
//! calling task.

use crate::sched::{Scheduler, TaskId, TaskState, WaitObj};
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Source of mutex identifiers. Never reused; 0 is the "invalid" sentinel
/// left behind by `destroy()`.
static NEW_MUTEX_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KMutexFlags: u32 {
        const RECURSIVE = 1 << 0;
    }
}

struct KMutexState {
    flags: KMutexFlags,
    owner: Option<TaskId>,
    /// Recursion depth; meaningful only for recursive mutexes while owned
    lock_count: u32,
}

pub struct KMutex {
    /// Monotonically assigned, nonzero while the mutex is valid
    id: AtomicU64,
    state: Mutex<KMutexState>,
}

impl KMutex {
    pub fn new(flags: KMutexFlags) -> Self {
        Self {
            id: AtomicU64::new(NEW_MUTEX_ID.fetch_add(1, Ordering::SeqCst)),
            state: Mutex::new(KMutexState {
                flags,
                owner: None,
                lock_count: 0,
            }),
        }
    }

    /// Zero the object. The id becomes 0, the sentinel for "invalid".
    pub fn destroy(&self) {
        let mut st = self.state.lock();
        assert!(st.owner.is_none(), "kmutex destroyed while held");
        st.flags = KMutexFlags::empty();
        st.lock_count = 0;
        self.id.store(0, Ordering::SeqCst);
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn is_valid(&self) -> bool {
        self.id() != 0
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock().owner
    }

    pub fn is_held_by_current(&self, sched: &Scheduler) -> bool {
        self.state.lock().owner == Some(sched.current_task())
    }

    /// Acquire the mutex, sleeping if it is currently owned by another task
    pub fn lock(&self, sched: &Scheduler) {
        debug_assert!(self.is_valid());
        debug_assert!(!sched.in_irq_handler());
        sched.disable_preemption();

        let me = sched.current_task();
        let recursive;
        {
            let mut st = self.state.lock();
            recursive = st.flags.contains(KMutexFlags::RECURSIVE);

            if st.owner.is_none() {
                // Nobody owns this mutex, just take it
                st.owner = Some(me);

                if recursive {
                    st.lock_count += 1;
                }

                drop(st);
                sched.enable_preemption();
                return;
            }

            if recursive {
                assert!(st.lock_count > 0);

                if st.owner == Some(me) {
                    st.lock_count += 1;
                    drop(st);
                    sched.enable_preemption();
                    return;
                }
            } else {
                debug_assert!(
                    st.owner != Some(me),
                    "non-recursive kmutex relocked by its owner"
                );
            }
        }

        sched.wait_obj_set(me, WaitObj::KMutex(self.id()));
        sched.task_change_state(me, TaskState::Sleeping);

        sched.enable_preemption();
        sched.yield_now(); // sleep until the unlocker hands the mutex over

        // Ownership was transferred to this task before it was woken
        debug_assert_eq!(self.owner(), Some(me));

        if recursive {
            debug_assert_eq!(self.state.lock().lock_count, 1);
        }
    }

    /// Like `lock()` but never sleeps. Returns whether ownership was
    /// acquired (including a recursive re-acquire).
    pub fn trylock(&self, sched: &Scheduler) -> bool {
        debug_assert!(self.is_valid());
        debug_assert!(!sched.in_irq_handler());
        sched.disable_preemption();

        let me = sched.current_task();
        let mut success = false;
        {
            let mut st = self.state.lock();
            let recursive = st.flags.contains(KMutexFlags::RECURSIVE);

            if st.owner.is_none() {
                st.owner = Some(me);
                success = true;

                if recursive {
                    st.lock_count += 1;
                }
            } else if recursive && st.owner == Some(me) {
                st.lock_count += 1;
                success = true;
            }
        }

        sched.enable_preemption();
        success
    }

    /// Release the mutex. If other tasks are sleeping on it, ownership
    /// moves to the first one found in the sleeping list and that task
    /// becomes runnable.
    pub fn unlock(&self, sched: &Scheduler) {
        debug_assert!(self.is_valid());
        debug_assert!(!sched.in_irq_handler());
        sched.disable_preemption();

        {
            let mut st = self.state.lock();
            let me = sched.current_task();
            assert!(st.owner == Some(me), "kmutex unlocked by non-owner");

            let recursive = st.flags.contains(KMutexFlags::RECURSIVE);

            if recursive {
                assert!(st.lock_count > 0);
                st.lock_count -= 1;

                if st.lock_count > 0 {
                    drop(st);
                    sched.enable_preemption();
                    return;
                }
            }

            st.owner = None;

            // Unlock one task waiting to acquire this mutex
            for t in sched.sleeping_tasks() {
                debug_assert_eq!(sched.task_state(t), TaskState::Sleeping);

                if sched.wait_obj(t) == WaitObj::KMutex(self.id()) {
                    st.owner = Some(t);

                    if recursive {
                        st.lock_count = 1;
                    }

                    sched.wait_obj_reset(t);
                    sched.task_change_state(t, TaskState::Runnable);
                    break;
                }
            }
        }

        sched.enable_preemption();
    }
}
