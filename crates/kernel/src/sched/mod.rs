//! Cooperative scheduler interface
//!
//! Uniprocessor model: tasks are owned by the scheduler and identified by
//! [`TaskId`]. Preemption is gated by a non-negative counter; interrupts are
//! an independent axis tracked by the nested-interrupt vector stack. The
//! mutex and the IRQ dispatcher consume exactly this surface:
//! current task, task states, wait objects, the sleeping-task list, yield,
//! and the preemption counter.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

pub type TaskId = usize;

/// How many interrupt vectors can be active at once. Exceeding this is a
/// kernel invariant violation.
pub const MAX_NESTED_IRQS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Runnable,
    Sleeping,
}

/// What a sleeping task is blocked on.
///
/// The discriminant identifies the kind of waitable object; the payload is
/// the object's identifier (e.g. the mutex id), which the waker compares
/// when scanning the sleeping-task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitObj {
    #[default]
    None,
    KMutex(u64),
    Semaphore(u64),
    PipeRead(u64),
    PipeWrite(u64),
    Timer(u64),
}

/// Saved register snapshot handed to the kernel by the interrupt entry stubs
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Regs {
    pub int_num: u32,
    pub err_code: u32,
    pub ip: u64,
    pub sp: u64,
    pub flags: u64,
}

#[derive(Debug)]
struct Task {
    state: TaskState,
    wobj: WaitObj,
    saved_regs: Regs,
}

struct SchedInner {
    tasks: Vec<Task>,
    current: TaskId,
    /// Tasks in `Sleeping` state, in insertion order. Wakers scan this
    /// front to back.
    sleeping: Vec<TaskId>,
}

pub struct Scheduler {
    /// Zero means preemption is permitted; positive values inhibit it.
    preempt_count: AtomicU32,
    inner: Mutex<SchedInner>,
    /// Currently-active interrupt vectors, innermost last
    nested_irqs: Mutex<heapless::Vec<u32, MAX_NESTED_IRQS>>,
}

impl Scheduler {
    /// Create a scheduler with one running task (id 0), representing the
    /// boot flow of control.
    pub fn new() -> Self {
        let mut tasks = Vec::new();
        tasks.push(Task {
            state: TaskState::Running,
            wobj: WaitObj::None,
            saved_regs: Regs::default(),
        });

        Self {
            preempt_count: AtomicU32::new(0),
            inner: Mutex::new(SchedInner {
                tasks,
                current: 0,
                sleeping: Vec::new(),
            }),
            nested_irqs: Mutex::new(heapless::Vec::new()),
        }
    }

    /// Register a new runnable task and return its id
    pub fn spawn(&self) -> TaskId {
        let mut inner = self.inner.lock();
        inner.tasks.push(Task {
            state: TaskState::Runnable,
            wobj: WaitObj::None,
            saved_regs: Regs::default(),
        });
        inner.tasks.len() - 1
    }

    pub fn current_task(&self) -> TaskId {
        self.inner.lock().current
    }

    pub fn task_state(&self, t: TaskId) -> TaskState {
        self.inner.lock().tasks[t].state
    }

    pub fn wait_obj(&self, t: TaskId) -> WaitObj {
        self.inner.lock().tasks[t].wobj
    }

    /// Attach a wait object to a task about to go to sleep
    pub fn wait_obj_set(&self, t: TaskId, wobj: WaitObj) {
        debug_assert!(wobj != WaitObj::None);
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.tasks[t].wobj, WaitObj::None);
        inner.tasks[t].wobj = wobj;
    }

    pub fn wait_obj_reset(&self, t: TaskId) {
        self.inner.lock().tasks[t].wobj = WaitObj::None;
    }

    /// Move a task to a new state, maintaining the sleeping-task list
    pub fn task_change_state(&self, t: TaskId, new_state: TaskState) {
        let mut inner = self.inner.lock();
        let old_state = inner.tasks[t].state;

        if old_state == new_state {
            return;
        }

        inner.tasks[t].state = new_state;

        if new_state == TaskState::Sleeping {
            debug_assert!(!inner.sleeping.contains(&t));
            inner.sleeping.push(t);
        } else if old_state == TaskState::Sleeping {
            inner.sleeping.retain(|&s| s != t);
        }
    }

    /// Snapshot of the sleeping-task list, in insertion order
    pub fn sleeping_tasks(&self) -> Vec<TaskId> {
        self.inner.lock().sleeping.clone()
    }

    // --- preemption counter ---

    pub fn disable_preemption(&self) {
        self.preempt_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn enable_preemption(&self) {
        let prev = self.preempt_count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "unbalanced enable_preemption");
    }

    pub fn preemption_count(&self) -> u32 {
        self.preempt_count.load(Ordering::SeqCst)
    }

    pub fn is_preemption_enabled(&self) -> bool {
        self.preemption_count() == 0
    }

    // --- nested-interrupt accounting ---

    pub fn push_nested_interrupt(&self, vector: u32) {
        let mut stack = self.nested_irqs.lock();
        stack
            .push(vector)
            .expect("nested interrupt stack overflow");
    }

    pub fn pop_nested_interrupt(&self) {
        let mut stack = self.nested_irqs.lock();
        stack.pop().expect("nested interrupt stack underflow");
    }

    pub fn in_irq_handler(&self) -> bool {
        !self.nested_irqs.lock().is_empty()
    }

    /// How many instances of `vector` are on the stack. The timer handler
    /// uses this to detect re-entry.
    pub fn nested_vector_depth(&self, vector: u32) -> usize {
        self.nested_irqs
            .lock()
            .iter()
            .filter(|&&v| v == vector)
            .count()
    }

    // --- scheduling ---

    /// Pick the next runnable task (round-robin from the current one) and
    /// make it current. If nothing else is runnable the current task keeps
    /// the CPU.
    fn schedule(&self) {
        let mut inner = self.inner.lock();
        let n = inner.tasks.len();
        let curr = inner.current;

        let next = (1..=n)
            .map(|off| (curr + off) % n)
            .find(|&t| inner.tasks[t].state == TaskState::Runnable);

        let Some(next) = next else {
            return;
        };

        if inner.tasks[curr].state == TaskState::Running {
            inner.tasks[curr].state = TaskState::Runnable;
        }

        inner.tasks[next].state = TaskState::Running;
        inner.current = next;
    }

    /// Hand the CPU to another runnable task. Does not return until the
    /// calling task is itself rescheduled.
    pub fn yield_now(&self) {
        debug_assert!(self.is_preemption_enabled());
        let me = self.current_task();
        self.schedule();

        while self.current_task() != me {
            core::hint::spin_loop();
        }
    }

    /// Park the current task indefinitely and hand the CPU over. Used by
    /// kernel threads that have finished their work.
    pub fn exit_current(&self) {
        self.task_change_state(self.current_task(), TaskState::Sleeping);
        self.schedule();
    }

    /// Scheduler entry used by the IRQ dispatcher's bottom half. The nested
    /// interrupt has already been popped, so this runs outside interrupt
    /// context even though it was reached from an interrupt epilogue.
    pub fn schedule_outside_interrupt_context(&self) {
        debug_assert!(!self.in_irq_handler());
        self.schedule();
    }

    /// Record the register snapshot of the current task
    pub fn save_current_task_state(&self, regs: &Regs) {
        let mut inner = self.inner.lock();
        let curr = inner.current;
        inner.tasks[curr].saved_regs = *regs;
    }

    pub fn task_saved_regs(&self, t: TaskId) -> Regs {
        self.inner.lock().tasks[t].saved_regs
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    /// The system scheduler instance
    pub static ref SCHEDULER: Scheduler = Scheduler::new();
}

pub fn kernel_scheduler() -> &'static Scheduler {
    &SCHEDULER
}
