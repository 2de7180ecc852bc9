//! fork: duplicate the calling process
//!
//! The child is built from the parent's saved syscall frame: same segment
//! selectors, flags and general registers, `eax` forced to 0, resuming at
//! the parent's saved return address with an eagerly deep-copied user
//! window and a reference-counted copy of the open-file table.

use crate::error::KernelResult;
use crate::fs::file;
use crate::mm::AddressSpace;
use crate::sched;
use crate::syscall::{SyscallFrame, SYSCALL_ARG_WORDS};

use super::pcb::TaskId;
use super::{table, task_init, task_uninit};

/// Create a copy of the current process. Returns the child's pid; the child
/// itself resumes in user mode with a 0 return value in `eax`.
pub fn fork() -> KernelResult<u32> {
    let parent_id = super::current_task()?;
    let child_id = table::alloc_slot()?;

    match build_child(parent_id, child_id) {
        Ok(pid) => {
            sched::start(child_id);
            Ok(pid)
        }
        Err(e) => {
            // SAFETY: the half-built child never ran; this path owns it.
            let child = unsafe { table::task_mut(child_id) };
            for slot in child.files.iter_mut() {
                if let Some(id) = slot.take() {
                    file::release(id);
                }
            }
            task_uninit(child_id);
            table::free_slot(child_id);
            Err(e)
        }
    }
}

fn build_child(parent_id: TaskId, child_id: TaskId) -> KernelResult<u32> {
    // SAFETY: the parent is the running task; the child slot was just
    // claimed. Distinct slots, each owned here.
    let parent = unsafe { table::task_mut(parent_id) };
    // The trap frame the call gate pushed sits at the top of the parent's
    // kernel stack.
    let frame_addr = parent.tss.esp0 as usize - core::mem::size_of::<SyscallFrame>();
    // SAFETY: esp0 points at the parent's live kernel stack and the frame
    // was fully written on syscall entry.
    let frame = unsafe { &*(frame_addr as *const SyscallFrame) };

    // The child returns through a plain `ret`, not the gate's `retf n`, so
    // its stack starts above the copied argument words.
    task_init(
        child_id,
        parent.name(),
        false,
        frame.eip,
        frame.esp + 4 * SYSCALL_ARG_WORDS,
    )?;

    // SAFETY: distinct freshly claimed slot, owned here.
    let child = unsafe { table::task_mut(child_id) };

    // Share every open file, one reference each
    for (fd, slot) in parent.files.iter().enumerate() {
        if let Some(id) = slot {
            file::inc_ref(*id);
            child.files[fd] = Some(*id);
        }
    }

    // Register image from the parent's frame; eax = 0 is the child's fork
    // return value.
    child.tss.eax = 0;
    child.tss.ebx = frame.ebx;
    child.tss.ecx = frame.ecx;
    child.tss.edx = frame.edx;
    child.tss.esi = frame.esi;
    child.tss.edi = frame.edi;
    child.tss.ebp = frame.ebp;
    child.tss.cs = frame.cs;
    child.tss.ds = frame.ds;
    child.tss.es = frame.es;
    child.tss.fs = frame.fs;
    child.tss.gs = frame.gs;
    child.tss.eflags = frame.eflags;

    child.parent = Some(parent_id);
    child.heap_start = parent.heap_start;
    child.heap_end = parent.heap_end;

    // Replace the empty space task_init built with a deep copy of the
    // parent's user window.
    let fresh = AddressSpace::from_root(child.tss.cr3);
    let copied = AddressSpace::from_root(parent.tss.cr3).deep_copy()?;
    fresh.destroy();
    child.tss.cr3 = copied.root();

    Ok(child.pid)
}
