//! Task arena
//!
//! A fixed array of TCB slots. Slot allocation, freeing and whole-table
//! scans (zombie reaping, reparenting) run under the table's kernel mutex;
//! the scheduler follows list links through [`task_mut`] with interrupts
//! disabled instead. Both disciplines are safe on this uniprocessor because
//! neither can be preempted by the other mid-update.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::sched::sync::KMutex;

use super::pcb::{make_pid, Task, TaskId, TaskState};

/// Maximum live tasks
pub const TASK_CAPACITY: usize = 128;

struct TableCell(UnsafeCell<[Task; TASK_CAPACITY]>);

// SAFETY: access is serialized by TABLE_MUTEX (scans, slot lifecycle) or by
// disabled interrupts (scheduler link walks); single CPU.
unsafe impl Sync for TableCell {}

static TASKS: TableCell = TableCell(UnsafeCell::new([const { Task::empty() }; TASK_CAPACITY]));

/// Serializes slot allocation/free and table scans.
pub static TABLE_MUTEX: KMutex = KMutex::new();

/// Generation counter folded into pids so reused slots get fresh ids.
static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

/// Mutable access to one TCB.
///
/// # Safety
///
/// The caller must either hold `TABLE_MUTEX`, run with interrupts disabled,
/// or own the slot (its task is Created/Running and only the caller touches
/// it). No two live `&mut` borrows of the same slot may coexist.
pub unsafe fn task_mut(id: TaskId) -> &'static mut Task {
    debug_assert!((id.0 as usize) < TASK_CAPACITY);
    // SAFETY: bounds checked above; aliasing per the function contract.
    unsafe { &mut (*TASKS.0.get())[id.0 as usize] }
}

/// Mutable access to the whole arena, for scans under `TABLE_MUTEX`.
///
/// # Safety
///
/// The caller must hold `TABLE_MUTEX`.
pub unsafe fn tasks_mut() -> &'static mut [Task; TASK_CAPACITY] {
    // SAFETY: serialized per the function contract.
    unsafe { &mut *TASKS.0.get() }
}

/// Claim a free slot and stamp it with a fresh pid.
pub fn alloc_slot() -> KernelResult<TaskId> {
    TABLE_MUTEX.lock();
    // SAFETY: TABLE_MUTEX held.
    let tasks = unsafe { tasks_mut() };

    let mut found = None;
    for (slot, task) in tasks.iter_mut().enumerate() {
        if task.is_free() {
            let id = TaskId(slot as u16);
            *task = Task::empty();
            task.state = TaskState::Created;
            task.pid = make_pid(id, NEXT_GENERATION.fetch_add(1, Ordering::Relaxed));
            found = Some(id);
            break;
        }
    }

    TABLE_MUTEX.unlock();
    found.ok_or(KernelError::OutOfMemory {
        resource: "task slots",
    })
}

/// Return a slot to the free pool, zeroing the TCB.
pub fn free_slot(id: TaskId) {
    TABLE_MUTEX.lock();
    // SAFETY: TABLE_MUTEX held.
    let task = unsafe { task_mut(id) };
    *task = Task::empty();
    TABLE_MUTEX.unlock();
}

/// Find a live task by pid.
pub fn find_by_pid(pid: u32) -> Option<TaskId> {
    let id = super::pcb::pid_slot(pid);
    if (id.0 as usize) >= TASK_CAPACITY {
        return None;
    }
    TABLE_MUTEX.lock();
    // SAFETY: TABLE_MUTEX held.
    let task = unsafe { task_mut(id) };
    let hit = !task.is_free() && task.pid == pid;
    TABLE_MUTEX.unlock();
    hit.then_some(id)
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn reset_for_tests() {
    TABLE_MUTEX.lock();
    // SAFETY: TABLE_MUTEX held.
    let tasks = unsafe { tasks_mut() };
    for task in tasks.iter_mut() {
        *task = Task::empty();
    }
    TABLE_MUTEX.unlock();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::testing::sched_test_guard;

    #[test]
    fn slots_get_unique_pids_across_reuse() {
        let _guard = sched_test_guard();
        reset_for_tests();

        let a = alloc_slot().unwrap();
        // SAFETY: slot just allocated, owned by this test.
        let pid_a = unsafe { task_mut(a) }.pid;

        free_slot(a);
        let b = alloc_slot().unwrap();
        // SAFETY: slot just allocated, owned by this test.
        let pid_b = unsafe { task_mut(b) }.pid;

        assert_eq!(a, b, "lowest free slot is reused");
        assert_ne!(pid_a, pid_b, "generation keeps pids unique");
    }

    #[test]
    fn find_by_pid_rejects_stale_pids() {
        let _guard = sched_test_guard();
        reset_for_tests();

        let a = alloc_slot().unwrap();
        // SAFETY: slot owned by this test.
        let pid_a = unsafe { task_mut(a) }.pid;
        assert_eq!(find_by_pid(pid_a), Some(a));

        free_slot(a);
        let _b = alloc_slot().unwrap();
        assert_eq!(find_by_pid(pid_a), None, "stale pid no longer resolves");
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let _guard = sched_test_guard();
        reset_for_tests();

        for _ in 0..TASK_CAPACITY {
            alloc_slot().unwrap();
        }
        assert!(matches!(
            alloc_slot(),
            Err(KernelError::OutOfMemory { .. })
        ));
    }
}
