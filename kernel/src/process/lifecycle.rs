//! exit and wait
//!
//! A task exits into the Zombie state and stays there until its parent (or
//! the first task, after reparenting) reaps it: teardown of the address
//! space, kernel stack and TSS selector happens on the reaping side, so the
//! exiting task's kernel stack stays valid through its final dispatch.

use crate::error::KernelResult;
use crate::fs;
use crate::sched;
use crate::sched::queue::Link;
use crate::sched::TaskLinks;

use super::pcb::{TaskState, TASK_FILES_MAX};
use super::{table, task_uninit};

/// Terminate the calling task. Control does not return (on hardware); the
/// final dispatch switches away forever.
pub fn exit(status: i32) {
    let Ok(cur_id) = super::current_task() else {
        panic!("exit with no current task");
    };

    // Close every open descriptor while the fd table is still ours.
    for fd in 0..TASK_FILES_MAX {
        // SAFETY: own TCB.
        let has_file = unsafe { table::task_mut(cur_id) }.files[fd].is_some();
        if has_file {
            let _ = fs::close(fd);
        }
    }

    let first = sched::first_task();

    // Hand live children to the first task; remember if any of them is
    // already a Zombie, because we are about to stop being able to reap.
    let mut moved_zombie = false;
    table::TABLE_MUTEX.lock();
    // SAFETY: TABLE_MUTEX held.
    let tasks = unsafe { table::tasks_mut() };
    for task in tasks.iter_mut() {
        if !task.is_free() && task.parent == Some(cur_id) {
            task.parent = first;
            if task.state == TaskState::Zombie {
                moved_zombie = true;
            }
        }
    }
    table::TABLE_MUTEX.unlock();

    sched::with_sched(|s| {
        // SAFETY: inside the scheduler critical section.
        let parent = unsafe { table::task_mut(cur_id) }.parent;

        // Orphaned zombies: make sure the adopting first task gets to reap
        // them (unless it is also the waiting parent, woken below).
        if moved_zombie && parent != s.first {
            if let Some(first) = s.first {
                // SAFETY: inside the scheduler critical section.
                let first_task = unsafe { table::task_mut(first) };
                if first_task.state == TaskState::Waiting {
                    s.set_ready(first);
                }
            }
        }

        if let Some(parent) = parent {
            // SAFETY: inside the scheduler critical section.
            if unsafe { table::task_mut(parent) }.state == TaskState::Waiting {
                s.set_ready(parent);
            }
        }

        // SAFETY: inside the scheduler critical section.
        let task = unsafe { table::task_mut(cur_id) };
        task.exit_status = status;
        task.state = TaskState::Zombie;
        s.dispatch();
    });
    // Unreachable on hardware; host tests fall through here.
}

/// Reap a Zombie child: returns its (pid, exit status). Blocks as Waiting
/// until a child exits if none is reapable yet.
pub fn wait() -> KernelResult<(u32, i32)> {
    let cur_id = super::current_task()?;

    loop {
        table::TABLE_MUTEX.lock();
        // SAFETY: TABLE_MUTEX held.
        let tasks = unsafe { table::tasks_mut() };

        let mut reaped = None;
        for (slot, task) in tasks.iter().enumerate() {
            if !task.is_free()
                && task.parent == Some(cur_id)
                && task.state == TaskState::Zombie
            {
                reaped = Some(super::pcb::TaskId(slot as u16));
                break;
            }
        }

        if let Some(id) = reaped {
            // SAFETY: TABLE_MUTEX held; the zombie no longer runs.
            let task = unsafe { table::task_mut(id) };
            let pid = task.pid;
            let status = task.exit_status;

            task_uninit(id);
            table::TABLE_MUTEX.unlock();

            sched::with_sched(|s| {
                s.all.remove(&mut TaskLinks, Link::All, id);
            });
            table::free_slot(id);
            return Ok((pid, status));
        }

        table::TABLE_MUTEX.unlock();

        // No reapable child yet: block until an exit wakes us.
        sched::with_sched(|s| {
            if let Some(cur) = s.current {
                // SAFETY: inside the scheduler critical section.
                unsafe { table::task_mut(cur) }.state = TaskState::Waiting;
                s.dispatch();
            }
        });
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::testing::*;

    #[test]
    fn exit_marks_zombie_and_wakes_waiting_parent() {
        let _guard = sched_test_guard();
        reset_sched();

        let parent = spawn_fake_task("parent");
        let child = spawn_fake_task("child");
        task_of(child).parent = Some(parent);
        task_of(parent).state = crate::process::pcb::TaskState::Waiting;

        make_current(child);
        exit(7);

        assert_eq!(state_of(child), TaskState::Zombie);
        assert_eq!(task_of(child).exit_status, 7);
        assert_ne!(state_of(parent), TaskState::Waiting, "parent woken");
    }

    #[test]
    fn exit_reparents_children_to_first_task() {
        let _guard = sched_test_guard();
        reset_sched();

        let init = spawn_fake_task("first");
        crate::sched::with_sched(|s| s.first = Some(init));
        task_of(init).state = TaskState::Waiting;

        let parent = spawn_fake_task("parent");
        let orphan = spawn_fake_task("orphan");
        task_of(orphan).parent = Some(parent);
        task_of(orphan).state = TaskState::Zombie;

        make_current(parent);
        exit(0);

        assert_eq!(task_of(orphan).parent, Some(init), "orphan adopted");
        assert_ne!(
            state_of(init),
            TaskState::Waiting,
            "first task woken to reap the inherited zombie"
        );
    }

    #[test]
    fn wait_reaps_zombie_child_and_frees_the_slot() {
        let _guard = sched_test_guard();
        reset_sched();

        let parent = spawn_fake_task("parent");
        let child = spawn_fake_task("child");
        let child_pid = task_of(child).pid;
        task_of(child).parent = Some(parent);
        task_of(child).state = TaskState::Zombie;
        task_of(child).exit_status = 7;
        crate::sched::with_sched(|s| {
            s.all.push_back(&mut TaskLinks, Link::All, child);
        });

        make_current(parent);
        let (pid, status) = wait().unwrap();
        assert_eq!(pid, child_pid);
        assert_eq!(status, 7);
        assert!(task_of(child).is_free(), "slot zeroed after reaping");
    }
}
