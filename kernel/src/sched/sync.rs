//! Blocking synchronization primitives
//!
//! A recursive mutex and a counting semaphore, layered directly on the
//! scheduler: contenders park on a FIFO wait list threaded through their
//! TCB's wait node and the head is handed ownership directly on release, so
//! there is no barging. All state changes happen inside the scheduler
//! critical section (interrupts disabled).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::process::pcb::{TaskId, TaskState};
use crate::process::table;

use super::queue::{Link, ListHead};
use super::{with_sched, TaskLinks};

struct MutexState {
    owner: Option<TaskId>,
    depth: u32,
    waiters: ListHead,
}

/// Recursive kernel mutex.
///
/// Safe to lock before the scheduler starts (boot runs single threaded with
/// no current task); recursion is per owner, and unlocking a mutex the
/// caller does not own is a fatal kernel bug.
pub struct KMutex {
    state: UnsafeCell<MutexState>,
}

// SAFETY: state is only touched inside the scheduler critical section.
unsafe impl Sync for KMutex {}

impl KMutex {
    pub const fn new() -> Self {
        Self {
            state: UnsafeCell::new(MutexState {
                owner: None,
                depth: 0,
                waiters: ListHead::new(),
            }),
        }
    }

    pub fn lock(&self) {
        with_sched(|s| {
            // SAFETY: inside the scheduler critical section.
            let st = unsafe { &mut *self.state.get() };

            if st.depth == 0 {
                st.depth = 1;
                st.owner = s.current;
            } else if st.owner == s.current && s.current.is_some() {
                st.depth += 1;
            } else {
                let cur = s
                    .current
                    .expect("contended mutex before the scheduler started");
                st.waiters.push_back(&mut TaskLinks, Link::Wait, cur);
                // SAFETY: inside the scheduler critical section.
                unsafe { table::task_mut(cur) }.state = TaskState::Blocked;
                s.dispatch();
                // When we run again the releaser has made us the owner.
            }
        });
    }

    pub fn unlock(&self) {
        with_sched(|s| {
            // SAFETY: inside the scheduler critical section.
            let st = unsafe { &mut *self.state.get() };

            assert!(
                st.depth > 0 && st.owner == s.current,
                "unlock of a mutex the caller does not own"
            );

            st.depth -= 1;
            if st.depth > 0 {
                return;
            }

            match st.waiters.pop_front(&mut TaskLinks, Link::Wait) {
                Some(next) => {
                    // Direct hand-off: the head becomes the owner before it
                    // runs, so late arrivals cannot barge.
                    st.owner = Some(next);
                    st.depth = 1;
                    s.set_ready(next);
                    s.dispatch();
                }
                None => st.owner = None,
            }
        });
    }

    /// Snapshot of (owner, depth, waiter count) for diagnostics and tests.
    pub fn state(&self) -> (Option<TaskId>, u32, usize) {
        with_sched(|_| {
            // SAFETY: inside the scheduler critical section.
            let st = unsafe { &*self.state.get() };
            (st.owner, st.depth, st.waiters.len())
        })
    }

    fn lock_nonrecursive(&self) {
        self.lock();
        // SAFETY: we hold the lock, and hold-over checks run with interrupts
        // disabled.
        let depth = with_sched(|_| unsafe { &*self.state.get() }.depth);
        assert!(depth == 1, "re-entrant acquisition of a data lock");
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// A value guarded by a [`KMutex`], with RAII locking.
///
/// Used for the kernel's data tables (frame allocator, file table). The
/// guard asserts non-recursive use. Nothing may block while holding the
/// frame allocator's lock; the other tables tolerate it.
pub struct KLock<T> {
    mutex: KMutex,
    value: UnsafeCell<T>,
}

// SAFETY: access to value is serialized by the mutex.
unsafe impl<T: Send> Sync for KLock<T> {}

impl<T> KLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            mutex: KMutex::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> KLockGuard<'_, T> {
        self.mutex.lock_nonrecursive();
        KLockGuard { lock: self }
    }
}

pub struct KLockGuard<'a, T> {
    lock: &'a KLock<T>,
}

impl<T> Deref for KLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the mutex.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for KLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the mutex exclusively.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for KLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.mutex.unlock();
    }
}

struct SemState {
    count: u32,
    waiters: ListHead,
}

/// Counting semaphore with a FIFO wait list.
///
/// The disk driver's completion handshake is the main customer: the IRQ
/// handler posts from interrupt context (never blocks), the transferring
/// task waits.
pub struct KSemaphore {
    state: UnsafeCell<SemState>,
}

// SAFETY: state is only touched inside the scheduler critical section.
unsafe impl Sync for KSemaphore {}

impl KSemaphore {
    pub const fn new(initial: u32) -> Self {
        Self {
            state: UnsafeCell::new(SemState {
                count: initial,
                waiters: ListHead::new(),
            }),
        }
    }

    /// P: take a unit or block until one is posted.
    pub fn wait(&self) {
        with_sched(|s| {
            // SAFETY: inside the scheduler critical section.
            let st = unsafe { &mut *self.state.get() };

            if st.count > 0 {
                st.count -= 1;
                return;
            }

            let Some(cur) = s.current else {
                // Boot-time waits with a zero count cannot make progress.
                panic!("semaphore wait before the scheduler started");
            };
            st.waiters.push_back(&mut TaskLinks, Link::Wait, cur);
            // SAFETY: inside the scheduler critical section.
            unsafe { table::task_mut(cur) }.state = TaskState::Blocked;
            s.dispatch();
        });
    }

    /// V: wake the first waiter, or bank the unit.
    pub fn notify(&self) {
        with_sched(|s| {
            // SAFETY: inside the scheduler critical section.
            let st = unsafe { &mut *self.state.get() };

            match st.waiters.pop_front(&mut TaskLinks, Link::Wait) {
                Some(next) => {
                    s.set_ready(next);
                    s.dispatch();
                }
                None => st.count += 1,
            }
        });
    }

    /// Current count (waiters pending ⇒ 0).
    pub fn count(&self) -> u32 {
        with_sched(|_| {
            // SAFETY: inside the scheduler critical section.
            unsafe { &*self.state.get() }.count
        })
    }

    #[cfg(all(test, not(target_os = "none")))]
    pub(crate) fn waiter_count(&self) -> usize {
        with_sched(|_| {
            // SAFETY: inside the scheduler critical section.
            unsafe { &*self.state.get() }.waiters.len()
        })
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::testing::*;
    use super::super::{current, with_sched};
    use super::*;

    #[test]
    fn uncontended_lock_tracks_owner_and_depth() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        make_current(a);

        let mutex = KMutex::new();
        assert_eq!(mutex.state(), (None, 0, 0));

        mutex.lock();
        assert_eq!(mutex.state(), (Some(a), 1, 0));

        mutex.lock();
        assert_eq!(mutex.state(), (Some(a), 2, 0), "recursive per owner");

        mutex.unlock();
        assert_eq!(mutex.state(), (Some(a), 1, 0));
        mutex.unlock();
        assert_eq!(mutex.state(), (None, 0, 0));
    }

    #[test]
    fn contender_blocks_and_receives_handoff() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        let b = spawn_fake_task("b");
        make_current(a);

        let mutex = KMutex::new();
        mutex.lock();

        // b contends: parks on the wait list, a keeps running (host switch
        // is a no-op, so control returns straight to us)
        make_current(b);
        mutex.lock();
        assert_eq!(mutex.state(), (Some(a), 1, 1));
        assert_eq!(state_of(b), TaskState::Blocked);

        // Owner invariant: waiters present ⇒ owned
        let (owner, depth, waiters) = mutex.state();
        assert!(owner.is_some() && depth >= 1 && waiters > 0);

        // a releases: b is handed the lock before it ever runs
        make_current(a);
        mutex.unlock();
        assert_eq!(mutex.state(), (Some(b), 1, 0));
        assert_eq!(state_of(b), TaskState::Ready, "handoff head queued to run");
        assert_eq!(current(), Some(a), "release does not preempt the releaser");
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn unlock_by_non_owner_is_fatal() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        let b = spawn_fake_task("b");
        make_current(a);

        let mutex = KMutex::new();
        mutex.lock();
        make_current(b);
        mutex.unlock();
    }

    #[test]
    fn klock_guards_data() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        make_current(a);

        let cell = KLock::new(41);
        {
            let mut v = cell.lock();
            *v += 1;
        }
        assert_eq!(*cell.lock(), 42);
    }

    #[test]
    fn semaphore_counts_without_waiters() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        make_current(a);

        let sem = KSemaphore::new(2);
        sem.wait();
        sem.wait();
        assert_eq!(sem.count(), 0);

        sem.notify();
        sem.notify();
        sem.notify();
        assert_eq!(sem.count(), 3, "no waiters: units bank up");
    }

    #[test]
    fn semaphore_blocks_at_zero_and_wakes_fifo() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        let b = spawn_fake_task("b");
        let c = spawn_fake_task("c");

        let sem = KSemaphore::new(0);

        make_current(b);
        sem.wait();
        make_current(c);
        sem.wait();
        assert_eq!(sem.waiter_count(), 2);
        assert_eq!(sem.count(), 0, "waiters present implies zero count");
        assert_eq!(state_of(b), TaskState::Blocked);
        assert_eq!(state_of(c), TaskState::Blocked);

        make_current(a);
        sem.notify();
        // FIFO: b first
        assert_eq!(sem.waiter_count(), 1);
        assert_ne!(state_of(b), TaskState::Blocked);
        assert_eq!(state_of(c), TaskState::Blocked);

        sem.notify();
        assert_eq!(sem.waiter_count(), 0);
        assert_eq!(sem.count(), 0, "posts went to waiters, not the counter");
    }

    #[test]
    fn boot_time_lock_without_current_task() {
        let _guard = sched_test_guard();
        reset_sched();

        // No current task at all: the uncontended paths must still work.
        let mutex = KMutex::new();
        mutex.lock();
        mutex.unlock();

        with_sched(|s| assert!(s.current.is_none()));
    }
}
