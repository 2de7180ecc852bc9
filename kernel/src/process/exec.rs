//! execve: replace the process image
//!
//! Loads an ELF executable from the filesystem into a brand-new address
//! space, builds the argv image just below the stack ceiling, rewrites the
//! saved trap frame so the interrupt return lands on the new entry point,
//! and only then tears down the old address space. Any failure leaves the
//! caller's image untouched.

use crate::arch;
use crate::arch::tss::EFLAGS_DEFAULT;
use crate::elf::{ElfHeader, ProgramHeader, EHDR_SIZE, PHDR_SIZE};
use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::fs::file::OpenFlags;
use crate::mm::vas::{USER_ARG_SIZE, USER_STACK_PAGES, USER_STACK_TOP};
use crate::mm::{AddressSpace, PageFlags, PAGE_SIZE, USER_BASE};
use crate::syscall::{self, SyscallFrame, SYSCALL_ARG_WORDS};

use super::pcb::TaskId;
use super::table;

/// Header of the argv image the process start-up code expects on its stack.
#[repr(C)]
struct TaskArgs {
    ret_addr: u32,
    argc: u32,
    argv: u32,
}

const USER_FLAGS: PageFlags = PageFlags::PRESENT
    .union(PageFlags::USER)
    .union(PageFlags::WRITABLE);

/// Replace the current process image with the executable at `name_ptr`.
///
/// `argv_ptr` is the caller's NULL-terminated pointer array; the
/// environment argument of the syscall is accepted and ignored.
pub fn execve(name_ptr: *const u8, argv_ptr: *const *const u8) -> KernelResult<u32> {
    let id = super::current_task()?;

    // Everything read from the old user space happens before the directory
    // switch: the name now, argv during the stack build.
    let mut name_buf = [0u8; 64];
    let name = syscall::user_cstr(name_ptr, &mut name_buf)?;
    {
        // SAFETY: own TCB.
        let task = unsafe { table::task_mut(id) };
        task.set_name(basename(name));
    }

    let new_space = AddressSpace::new_user()?;
    let result = exec_into(id, name, argv_ptr, &new_space);
    if result.is_err() {
        new_space.destroy();
    }
    result
}

fn exec_into(
    id: TaskId,
    name: &str,
    argv_ptr: *const *const u8,
    new_space: &AddressSpace,
) -> KernelResult<u32> {
    let (entry, heap_top) = load_elf_file(name, new_space)?;

    // Fixed-size stack just below the ceiling; the page reserved above the
    // stack top holds the argv image.
    let stack_size = USER_STACK_PAGES * PAGE_SIZE;
    let stack_top = USER_STACK_TOP - USER_ARG_SIZE;
    new_space.alloc_for(USER_STACK_TOP - stack_size, stack_size, USER_FLAGS)?;

    let argc = count_args(argv_ptr);
    copy_args(stack_top, new_space, argc, argv_ptr)?;

    // SAFETY: own TCB.
    let task = unsafe { table::task_mut(id) };
    task.heap_start = heap_top;
    task.heap_end = heap_top;

    // Reset the saved trap frame: the interrupt return becomes the first
    // instruction of the new image.
    let frame_addr = task.tss.esp0 as usize - core::mem::size_of::<SyscallFrame>();
    // SAFETY: esp0 points at this task's live kernel stack.
    let frame = unsafe { &mut *(frame_addr as *mut SyscallFrame) };
    frame.eip = entry;
    frame.eax = 0;
    frame.ebx = 0;
    frame.ecx = 0;
    frame.edx = 0;
    frame.esi = 0;
    frame.edi = 0;
    frame.ebp = 0;
    frame.eflags = EFLAGS_DEFAULT;
    // The gate's argument words are popped by the user-side stub's `ret`
    frame.esp = stack_top - 4 * SYSCALL_ARG_WORDS;

    let old_root = task.tss.cr3;
    task.tss.cr3 = new_space.root();
    arch::set_page_dir(new_space.root());
    AddressSpace::from_root(old_root).destroy();

    Ok(0)
}

/// Load every user-range LOAD segment; returns (entry, highest memsz end).
fn load_elf_file(name: &str, space: &AddressSpace) -> KernelResult<(u32, u32)> {
    let fd = fs::open(name, OpenFlags::empty())?;
    let result = load_segments(fd, space);
    let _ = fs::close(fd);
    result
}

fn load_segments(fd: usize, space: &AddressSpace) -> KernelResult<(u32, u32)> {
    let mut ehdr_buf = [0u8; EHDR_SIZE];
    if fs::read(fd, &mut ehdr_buf)? != EHDR_SIZE {
        return Err(KernelError::BadExecutable);
    }
    let ehdr = ElfHeader::parse(&ehdr_buf)?;

    let mut heap_top = 0u32;
    let mut phoff = ehdr.phoff;
    for _ in 0..ehdr.phnum {
        fs::lseek(fd, phoff, 0)?;
        phoff += ehdr.phentsize as u32;

        let mut phdr_buf = [0u8; PHDR_SIZE];
        if fs::read(fd, &mut phdr_buf)? != PHDR_SIZE {
            return Err(KernelError::BadExecutable);
        }
        let phdr = ProgramHeader::parse(&phdr_buf)?;

        if !phdr.is_load() || phdr.vaddr < USER_BASE {
            continue;
        }

        load_segment(fd, &phdr, space)?;
        heap_top = heap_top.max(phdr.vaddr + phdr.memsz);
    }

    Ok((ehdr.entry, heap_top))
}

fn load_segment(fd: usize, phdr: &ProgramHeader, space: &AddressSpace) -> KernelResult<()> {
    // The toolchain aligns segments; anything else is a malformed image.
    if phdr.vaddr % PAGE_SIZE != 0 || phdr.filesz > phdr.memsz {
        return Err(KernelError::BadExecutable);
    }

    space.alloc_for(phdr.vaddr, phdr.memsz, USER_FLAGS)?;

    // Zero the whole span first so the region past filesz (.bss) is clean
    let mut off = 0;
    while off < phdr.memsz {
        let chunk = (phdr.memsz - off).min(PAGE_SIZE);
        let paddr = segment_frame(space, phdr.vaddr + off)?;
        // SAFETY: a frame just mapped for this segment, identity visible
        // through the kernel window.
        unsafe { core::ptr::write_bytes(paddr as *mut u8, 0, chunk as usize) };
        off += chunk;
    }

    // Stream the file contents in page-sized chunks, writing through the
    // physical alias (the new directory is not loaded yet).
    fs::lseek(fd, phdr.offset, 0)?;
    let mut vaddr = phdr.vaddr;
    let mut remaining = phdr.filesz;
    while remaining > 0 {
        let chunk = remaining.min(PAGE_SIZE);
        let paddr = segment_frame(space, vaddr)?;
        // SAFETY: same mapping as above; chunk stays within one frame.
        let buf = unsafe { core::slice::from_raw_parts_mut(paddr as *mut u8, chunk as usize) };
        if fs::read(fd, buf)? != chunk as usize {
            return Err(KernelError::BadExecutable);
        }
        vaddr += chunk;
        remaining -= chunk;
    }

    Ok(())
}

fn segment_frame(space: &AddressSpace, vaddr: u32) -> KernelResult<u32> {
    space.translate(vaddr).ok_or(KernelError::BadExecutable)
}

/// Number of entries before the NULL terminator of a user argv array.
fn count_args(argv: *const *const u8) -> usize {
    if argv.is_null() {
        return 0;
    }
    let mut count = 0;
    while count < ARG_MAX {
        // SAFETY: user array read through the current address space;
        // bounded by ARG_MAX.
        let entry = unsafe { *argv.add(count) };
        if entry.is_null() {
            break;
        }
        count += 1;
    }
    count
}

const ARG_MAX: usize = 64;

/// Build the argv image at `to` in the new space:
/// `TaskArgs`, then `argc + 1` string pointers, then the strings.
fn copy_args(
    to: u32,
    space: &AddressSpace,
    argc: usize,
    argv: *const *const u8,
) -> KernelResult<()> {
    let args = TaskArgs {
        ret_addr: 0,
        argc: argc as u32,
        argv: to + core::mem::size_of::<TaskArgs>() as u32,
    };

    // The pointer table is written through its physical alias; the whole
    // argv area lives inside one reserved page.
    let table_vaddr = to + core::mem::size_of::<TaskArgs>() as u32;
    let table_paddr = space
        .translate(table_vaddr)
        .ok_or(KernelError::InvalidArgument {
            what: "argv area unmapped",
        })?;
    debug_assert!(table_vaddr + 4 * (argc as u32 + 1) <= USER_STACK_TOP);
    let table = table_paddr as *mut u32;

    let mut dest = table_vaddr + 4 * (argc as u32 + 1);
    for i in 0..argc {
        // SAFETY: argv has at least argc non-null entries (just counted).
        let from = unsafe { *argv.add(i) };
        let len = syscall::user_strlen(from) + 1;

        space.copy_to(dest, from, len)?;
        // SAFETY: table points at the mapped argv page; i ≤ argc.
        unsafe { *table.add(i) = dest };
        dest += len as u32;
    }
    if argc > 0 {
        // SAFETY: slot argc is within the mapped table.
        unsafe { *table.add(argc) = 0 };
    }

    space.copy_to(
        to,
        &args as *const TaskArgs as *const u8,
        core::mem::size_of::<TaskArgs>(),
    )
}

/// Final path component, the process's display name.
fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/home/shell"), "shell");
        assert_eq!(basename("shell"), "shell");
        assert_eq!(basename("/home/a/b"), "b");
    }

    #[test]
    fn count_args_handles_null_and_terminator() {
        assert_eq!(count_args(core::ptr::null()), 0);

        let a = b"one\0";
        let b = b"two\0";
        let argv = [
            a.as_ptr(),
            b.as_ptr(),
            core::ptr::null(),
            // garbage beyond the terminator must not be counted
            a.as_ptr(),
        ];
        assert_eq!(count_args(argv.as_ptr()), 2);
    }
}
