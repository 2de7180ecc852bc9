//! Process management
//!
//! Task creation and teardown, the first-task bring-up, and the per-process
//! memory break. The fork/exec/wait/exit paths live in their own modules.

pub mod fork;
pub mod lifecycle;
pub mod pcb;
pub mod table;

mod exec;

pub use exec::execve;
pub use fork::fork;
pub use lifecycle::{exit, wait};

use crate::arch::{self, tss::EFLAGS_DEFAULT};
use crate::error::{KernelError, KernelResult};
use crate::mm::{frame_allocator, AddressSpace, PageFlags, PAGE_SIZE};
use crate::sched;

use pcb::{TaskId, TASK_TIME_SLICE_DEFAULT};

/// The running task, or an error before the scheduler starts.
pub(crate) fn current_task() -> KernelResult<TaskId> {
    sched::current().ok_or(KernelError::InvalidArgument {
        what: "no current task",
    })
}

/// Initialize a freshly claimed TCB slot: TSS selector, kernel stack, user
/// address space, segments, accounting fields.
///
/// `esp == 0` means "run on the kernel stack" (ring-0 tasks like idle).
pub(crate) fn task_init(
    id: TaskId,
    name: &str,
    kernel_mode: bool,
    entry: u32,
    esp: u32,
) -> KernelResult<()> {
    // SAFETY: the caller just claimed this slot and is its sole owner.
    let task = unsafe { table::task_mut(id) };

    let tss_base = &task.tss as *const _ as u32;
    let tss_sel = arch::tss_selector_alloc(tss_base)?;

    let kernel_stack = match frame_allocator::alloc_page() {
        Ok(page) => page,
        Err(e) => {
            arch::selector_free(tss_sel);
            return Err(e);
        }
    };

    let (code_sel, data_sel) = if kernel_mode {
        (arch::KERNEL_CODE_SEL, arch::KERNEL_DATA_SEL)
    } else {
        sched::app_selectors()
    };

    task.tss = crate::arch::tss::TaskStateSegment::zeroed();
    task.tss.eip = entry;
    task.tss.esp = if esp != 0 { esp } else { kernel_stack + PAGE_SIZE };
    task.tss.esp0 = kernel_stack + PAGE_SIZE;
    task.tss.ss0 = arch::KERNEL_DATA_SEL as u32;
    task.tss.eflags = EFLAGS_DEFAULT;
    task.tss.cs = code_sel as u32;
    task.tss.ds = data_sel as u32;
    task.tss.es = data_sel as u32;
    task.tss.ss = data_sel as u32;
    task.tss.fs = data_sel as u32;
    task.tss.gs = data_sel as u32;
    task.tss.iomap = 0;

    let space = match AddressSpace::new_user() {
        Ok(space) => space,
        Err(e) => {
            arch::selector_free(tss_sel);
            frame_allocator::free_page(kernel_stack);
            return Err(e);
        }
    };
    task.tss.cr3 = space.root();
    task.tss_sel = tss_sel;

    task.set_name(name);
    task.parent = None;
    task.heap_start = 0;
    task.heap_end = 0;
    task.sleep_ticks = 0;
    task.time_slice = TASK_TIME_SLICE_DEFAULT;
    task.slice_ticks = TASK_TIME_SLICE_DEFAULT;

    Ok(())
}

/// Release everything a TCB owns: selector, kernel stack, address space.
///
/// The slot itself is returned to the arena by the caller.
pub(crate) fn task_uninit(id: TaskId) {
    // SAFETY: the task is dead (or never started); the caller owns the slot.
    let task = unsafe { table::task_mut(id) };

    if task.tss_sel != 0 {
        arch::selector_free(task.tss_sel);
        task.tss_sel = 0;
    }
    if task.tss.esp0 != 0 {
        frame_allocator::free_page(task.tss.esp0 - PAGE_SIZE);
        task.tss.esp0 = 0;
    }
    if task.tss.cr3 != 0 {
        AddressSpace::from_root(task.tss.cr3).destroy();
        task.tss.cr3 = 0;
    }
}

/// Create a ring-0 task around a kernel function. Used for the idle task;
/// the caller decides whether it is ever enqueued.
pub fn spawn_kernel_task(name: &str, entry: u32) -> KernelResult<TaskId> {
    let id = table::alloc_slot()?;
    match task_init(id, name, true, entry, 0) {
        Ok(()) => Ok(id),
        Err(e) => {
            table::free_slot(id);
            Err(e)
        }
    }
}

/// Launch the embedded first task.
///
/// Its binary travels inside the kernel image; it is copied into a fresh
/// user mapping at its linked address, given its heap marks, made current
/// and the task register loaded so the first hardware switch has somewhere
/// to store the outgoing state.
#[cfg(target_arch = "x86")]
pub fn first_task_start() -> KernelResult<()> {
    extern "C" {
        static __first_task_start: u8;
        static __first_task_end: u8;
    }

    // SAFETY: linker-provided bounds of the embedded first-task image.
    let (blob_start, blob_end) = unsafe {
        (
            &__first_task_start as *const u8 as u32,
            &__first_task_end as *const u8 as u32,
        )
    };
    let copy_size = blob_end - blob_start;
    let alloc_size = 10 * PAGE_SIZE;
    assert!(copy_size < alloc_size, "first task image exceeds its window");

    // The image is linked to run at the base of the user window; the space
    // above it (up to alloc_size) is its initial stack.
    let entry = crate::mm::USER_BASE;

    let id = table::alloc_slot()?;
    task_init(id, "first task", false, entry, entry + alloc_size)?;

    // SAFETY: slot owned here until the task is started.
    let task = unsafe { table::task_mut(id) };
    task.heap_start = entry + copy_size;
    task.heap_end = task.heap_start;

    let space = AddressSpace::from_root(task.tss.cr3);
    let tss_sel = task.tss_sel;
    let root = task.tss.cr3;

    sched::with_sched(|s| {
        s.first = Some(id);
        s.current = Some(id);
        s.all.push_back(
            &mut sched::TaskLinks,
            crate::sched::queue::Link::All,
            id,
        );
        // SAFETY: inside the scheduler critical section.
        unsafe { table::task_mut(id) }.state = pcb::TaskState::Running;
    });

    // Switch to the task's directory (kernel window stays mapped), give the
    // image its pages and copy it in place.
    arch::set_page_dir(root);
    space.alloc_for(
        entry,
        alloc_size,
        PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
    )?;
    // SAFETY: source is the embedded image in kernel text, destination was
    // just mapped writable at entry.
    unsafe {
        core::ptr::copy_nonoverlapping(blob_start as *const u8, entry as *mut u8, copy_size as usize)
    };

    arch::load_task_register(tss_sel);
    Ok(())
}

/// Drop the boot context into the first task's user code. The task
/// register already names its TSS, so the first timer-driven switch has a
/// place to save this context.
#[cfg(target_arch = "x86")]
pub fn enter_first_task() -> ! {
    let id = sched::current().expect("first task not started");
    // SAFETY: reading the current task's TCB.
    let task = unsafe { table::task_mut(id) };
    arch::enter_user_mode(
        task.tss.eip,
        task.tss.esp,
        task.tss.cs,
        task.tss.ds,
        task.tss.eflags,
    )
}

/// Current pid.
pub fn getpid() -> KernelResult<u32> {
    let id = current_task()?;
    // SAFETY: reading own TCB.
    Ok(unsafe { table::task_mut(id) }.pid)
}

/// Grow (or query) the heap break.
///
/// `sbrk(0)` returns the break. A positive increment extends it, allocating
/// pages only when the break crosses a page boundary; growth within the
/// current partial page is free.
pub fn sbrk(increment: i32) -> KernelResult<u32> {
    let id = current_task()?;
    // SAFETY: caller is the running task, sole owner of its TCB.
    let task = unsafe { table::task_mut(id) };

    if increment < 0 {
        return Err(KernelError::InvalidArgument {
            what: "negative sbrk",
        });
    }

    let old_break = task.heap_end;
    if increment == 0 {
        return Ok(old_break);
    }

    let mut start = task.heap_end;
    let mut remaining = increment as u32;
    let end = start + remaining;

    let start_offset = start % PAGE_SIZE;
    if start_offset != 0 {
        if start_offset + remaining <= PAGE_SIZE {
            // Fits in the already-mapped partial page
            task.heap_end = end;
            return Ok(old_break);
        }
        let in_page = PAGE_SIZE - start_offset;
        start += in_page;
        remaining -= in_page;
    }

    if remaining > 0 {
        let space = AddressSpace::from_root(task.tss.cr3);
        space.alloc_for(
            start,
            end - start,
            PageFlags::PRESENT | PageFlags::USER | PageFlags::WRITABLE,
        )?;
    }

    task.heap_end = end;
    Ok(old_break)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::testing::*;

    #[test]
    fn sbrk_zero_reports_the_break() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        task_of(a).heap_start = 0x8010_0000;
        task_of(a).heap_end = 0x8010_0000;
        make_current(a);

        assert_eq!(sbrk(0).unwrap(), 0x8010_0000);
        assert_eq!(task_of(a).heap_end, 0x8010_0000, "query does not move it");
    }

    #[test]
    fn sbrk_within_the_partial_page_allocates_nothing() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        // Break sits 0x100 into a page: room for 0xF00 more bytes for free
        task_of(a).heap_end = 0x8010_0100;
        make_current(a);

        // The frame allocator is uninitialized in this test; an allocation
        // attempt would panic, so success proves the fast path was taken.
        assert_eq!(sbrk(0xF00).unwrap(), 0x8010_0100);
        assert_eq!(task_of(a).heap_end, 0x8010_1000);
    }

    #[test]
    fn sbrk_rejects_negative_increments() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        make_current(a);

        assert!(sbrk(-16).is_err());
    }

    #[test]
    fn getpid_reports_the_current_task() {
        let _guard = sched_test_guard();
        reset_sched();
        let a = spawn_fake_task("a");
        let pid = task_of(a).pid;
        make_current(a);

        assert_eq!(getpid().unwrap(), pid);
    }
}
