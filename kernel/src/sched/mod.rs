//! Task scheduler
//!
//! Single CPU, preemptive, fixed-priority round robin. All scheduler state
//! sits in one cell that can only be entered through [`with_sched`], which
//! disables interrupts for the duration; on a uniprocessor that *is* mutual
//! exclusion, and it is the invariant the blocking primitives in [`sync`]
//! are built on: interrupts disabled ⇒ no reschedule underneath you.
//!
//! The running task is on no list. Ready and sleep lists thread through the
//! TCB's run node; wait lists (mutex/semaphore/wait) through its wait node.

pub mod queue;
pub mod sync;

use core::cell::UnsafeCell;

use crate::arch;
use crate::process::pcb::{TaskId, TaskState};
use crate::process::table;

use queue::{Link, LinkAccess, ListHead, ListNode};

/// Timer period, ms per tick
pub const OS_TICK_MS: u32 = 10;

/// Link accessor over the global task arena.
///
/// Only used from inside the scheduler critical section, where arena access
/// is serialized by disabled interrupts.
pub(crate) struct TaskLinks;

impl LinkAccess for TaskLinks {
    fn node_mut(&mut self, id: TaskId, link: Link) -> &mut ListNode {
        // SAFETY: callers run inside the scheduler critical section.
        let task = unsafe { table::task_mut(id) };
        match link {
            Link::Run => &mut task.run_node,
            Link::Wait => &mut task.wait_node,
            Link::All => &mut task.all_node,
        }
    }
}

pub(crate) struct Scheduler {
    pub ready: ListHead,
    pub sleep: ListHead,
    pub all: ListHead,
    pub current: Option<TaskId>,
    pub idle: Option<TaskId>,
    pub first: Option<TaskId>,
    pub app_code_sel: u16,
    pub app_data_sel: u16,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            ready: ListHead::new(),
            sleep: ListHead::new(),
            all: ListHead::new(),
            current: None,
            idle: None,
            first: None,
            app_code_sel: 0,
            app_data_sel: 0,
        }
    }

    /// Queue `id` at the ready tail. The idle task is a fallback, never
    /// enqueued.
    pub fn set_ready(&mut self, id: TaskId) {
        if Some(id) == self.idle {
            return;
        }
        // SAFETY: inside the scheduler critical section.
        unsafe { table::task_mut(id) }.state = TaskState::Ready;
        self.ready.push_back(&mut TaskLinks, Link::Run, id);
    }

    /// Remove `id` from the ready list (it is about to block elsewhere).
    pub fn unqueue_ready(&mut self, id: TaskId) {
        if Some(id) == self.idle {
            return;
        }
        self.ready.remove(&mut TaskLinks, Link::Run, id);
    }

    /// Move a sleeping task off the sleep list.
    pub fn wake_from_sleep(&mut self, id: TaskId) {
        self.sleep.remove(&mut TaskLinks, Link::Run, id);
    }

    /// Pick the next task and switch to it if it differs from the current
    /// one. A Running current task keeps the CPU unless it is the idle task
    /// and real work became ready.
    pub fn dispatch(&mut self) {
        if let Some(cur) = self.current {
            // SAFETY: inside the scheduler critical section.
            let state = unsafe { table::task_mut(cur) }.state;
            if state == TaskState::Running && (Some(cur) != self.idle || self.ready.is_empty()) {
                return;
            }
        }

        let next = match self.ready.pop_front(&mut TaskLinks, Link::Run) {
            Some(id) => id,
            None => match self.idle {
                Some(id) => id,
                None => return,
            },
        };

        if Some(next) == self.current {
            // Sole ready task was the preempted current one; no switch.
            // SAFETY: inside the scheduler critical section.
            unsafe { table::task_mut(next) }.state = TaskState::Running;
            return;
        }

        self.current = Some(next);
        // SAFETY: inside the scheduler critical section.
        let task = unsafe { table::task_mut(next) };
        task.state = TaskState::Running;
        arch::switch_task(task.tss_sel);
        // Execution resumes here when the outgoing task is switched back in.
    }
}

struct SchedCell(UnsafeCell<Scheduler>);

// SAFETY: entered only via with_sched, which disables interrupts; single CPU.
unsafe impl Sync for SchedCell {}

static SCHED: SchedCell = SchedCell(UnsafeCell::new(Scheduler::new()));

/// Enter the scheduler critical section.
///
/// The closure must not re-enter `with_sched` (the primitives and scheduler
/// operations are all written as single entries).
pub(crate) fn with_sched<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    let flags = arch::irq_save();
    // SAFETY: interrupts are disabled on a uniprocessor, so this is the only
    // thread of control; interrupt handlers that reach this cell can only
    // run while no one is inside it.
    let result = f(unsafe { &mut *SCHED.0.get() });
    arch::irq_restore(flags);
    result
}

/// Bring up the scheduler: user segment selectors and the idle task.
pub fn init() {
    let (code_sel, data_sel) =
        arch::user_segments_alloc().expect("GDT exhausted before the first task");
    with_sched(|s| {
        s.app_code_sel = code_sel;
        s.app_data_sel = data_sel;
    });

    let idle = crate::process::spawn_kernel_task("idle", idle_entry as usize as u32)
        .expect("idle task creation cannot fail at boot");
    with_sched(|s| s.idle = Some(idle));
}

/// Idle body: halt until the next interrupt, forever.
fn idle_entry() -> ! {
    loop {
        arch::halt();
    }
}

/// Shared user-mode code/data selectors for new tasks.
pub fn app_selectors() -> (u16, u16) {
    with_sched(|s| (s.app_code_sel, s.app_data_sel))
}

/// The running task, if the scheduler has started.
pub fn current() -> Option<TaskId> {
    with_sched(|s| s.current)
}

/// First (init-like) task, target of reparenting.
pub fn first_task() -> Option<TaskId> {
    with_sched(|s| s.first)
}

/// Make `id` runnable (task_start).
pub fn start(id: TaskId) {
    with_sched(|s| {
        s.all.push_back(&mut TaskLinks, Link::All, id);
        s.set_ready(id);
    });
}

/// Voluntary round-robin hand-off.
pub fn yield_now() {
    with_sched(|s| {
        if s.ready.is_empty() {
            return;
        }
        if let Some(cur) = s.current {
            s.set_ready(cur);
            s.dispatch();
        }
    });
}

/// Sleep for at least `ms` milliseconds (rounded up to ticks, minimum one).
pub fn msleep(ms: u32) {
    let ms = ms.max(OS_TICK_MS);
    let ticks = ms.div_ceil(OS_TICK_MS);

    with_sched(|s| {
        let Some(cur) = s.current else { return };
        if Some(cur) == s.idle {
            return;
        }

        // SAFETY: inside the scheduler critical section.
        let task = unsafe { table::task_mut(cur) };
        task.state = TaskState::Sleep;
        task.sleep_ticks = ticks;
        s.sleep.push_back(&mut TaskLinks, Link::Run, cur);
        s.dispatch();
    });
}

/// Timer interrupt body: slice accounting, sleep countdown, dispatch.
///
/// Sleepers are woken *before* an exhausted current task is requeued, so a
/// just-woken task runs ahead of the preempted one.
pub fn timer_tick() {
    with_sched(|s| {
        let mut requeue = None;
        if let Some(cur) = s.current {
            if Some(cur) != s.idle {
                // SAFETY: inside the scheduler critical section.
                let task = unsafe { table::task_mut(cur) };
                task.slice_ticks = task.slice_ticks.saturating_sub(1);
                if task.slice_ticks == 0 {
                    task.slice_ticks = task.time_slice;
                    requeue = Some(cur);
                }
            }
        }

        let mut walker = s.sleep.first();
        while let Some(id) = walker {
            walker = TaskLinks.node_mut(id, Link::Run).next();

            // SAFETY: inside the scheduler critical section.
            let task = unsafe { table::task_mut(id) };
            task.sleep_ticks -= 1;
            if task.sleep_ticks == 0 {
                s.sleep.remove(&mut TaskLinks, Link::Run, id);
                s.set_ready(id);
            }
        }

        if let Some(cur) = requeue {
            s.set_ready(cur);
        }
        s.dispatch();
    });
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testing {
    use super::*;
    use crate::process::pcb::Task;

    /// Serializes every test that touches the global scheduler/task arena;
    /// the host test harness runs tests on multiple threads.
    pub fn sched_test_guard() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn reset_sched() {
        with_sched(|s| *s = Scheduler::new());
        table::reset_for_tests();
    }

    pub fn spawn_fake_task(name: &str) -> TaskId {
        let id = table::alloc_slot().unwrap();
        // SAFETY: freshly claimed slot, owned by the test.
        let task = unsafe { table::task_mut(id) };
        task.set_name(name);
        id
    }

    pub fn make_current(id: TaskId) {
        with_sched(|s| {
            s.current = Some(id);
            // SAFETY: inside the scheduler critical section.
            unsafe { table::task_mut(id) }.state = TaskState::Running;
        });
    }

    pub fn state_of(id: TaskId) -> TaskState {
        // SAFETY: tests are serialized by sched_test_guard.
        unsafe { table::task_mut(id) }.state
    }

    pub fn task_of(id: TaskId) -> &'static mut Task {
        // SAFETY: tests are serialized by sched_test_guard.
        unsafe { table::task_mut(id) }
    }
}
