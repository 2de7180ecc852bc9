//! Per-process virtual address spaces
//!
//! This is the only module that touches page-structure memory. The kernel
//! window (everything below [`USER_BASE`]) is identity mapped, so a frame's
//! physical address is also its kernel-visible pointer; the user window is
//! private to each address space and owned by it.
//!
//! Sharing works by aliasing: every user directory copies the kernel-window
//! directory entries from the canonical kernel directory, so they all point
//! at the same kernel page tables and a kernel-table edit is globally
//! visible without broadcast.

use core::cell::UnsafeCell;

use crate::error::KernelResult;

use super::frame_allocator;
use super::page_table::{
    page_align_down, page_count, page_offset, pde_index, pte_index, PageDirEntry, PageFlags,
    PageTableEntry, ENTRY_COUNT, PAGE_SIZE,
};

/// First virtual address of the private user window.
pub const USER_BASE: u32 = 0x8000_0000;

/// Ceiling of the user stack; the argv image sits in the reserved region
/// just below this address.
pub const USER_STACK_TOP: u32 = 0xE000_0000;

/// Fixed user stack size, in pages.
pub const USER_STACK_PAGES: u32 = 500;

/// Bytes reserved above the stack for the exec argument image.
pub const USER_ARG_SIZE: u32 = 4096;

/// A 4 KiB-aligned page directory.
#[repr(C, align(4096))]
pub struct PageDirectory(pub [PageDirEntry; ENTRY_COUNT]);

struct KernelDir(UnsafeCell<PageDirectory>);

// SAFETY: mutated only during mm::init, before the scheduler exists; read
// only afterwards.
unsafe impl Sync for KernelDir {}

static KERNEL_DIR: KernelDir = KernelDir(UnsafeCell::new(PageDirectory(
    [PageDirEntry::zero(); ENTRY_COUNT],
)));

/// Physical address of the canonical kernel directory.
///
/// The directory is kernel data, hence identity mapped: its pointer is its
/// physical address.
pub fn kernel_dir_paddr() -> u32 {
    KERNEL_DIR.0.get() as u32
}

/// View a directory frame as its entry array.
///
/// # Safety
///
/// `dir` must be the physical address of a live, 4 KiB-aligned page
/// directory, and the caller must be the only one mutating it (each
/// directory is touched only by its owning task, or by `fork` while the
/// owner is parked in the syscall).
unsafe fn dir_entries<'a>(dir: u32) -> &'a mut [PageDirEntry; ENTRY_COUNT] {
    // SAFETY: identity-mapped kernel window; aliasing per the function
    // contract.
    unsafe { &mut *(dir as *mut [PageDirEntry; ENTRY_COUNT]) }
}

/// View a page-table frame as its entry array.
///
/// # Safety
///
/// Same contract as [`dir_entries`], for a page-table frame.
unsafe fn table_entries<'a>(table_paddr: u32) -> &'a mut [PageTableEntry; ENTRY_COUNT] {
    // SAFETY: identity-mapped kernel window; aliasing per the function
    // contract.
    unsafe { &mut *(table_paddr as *mut [PageTableEntry; ENTRY_COUNT]) }
}

fn zero_frame(paddr: u32) {
    // SAFETY: the caller just allocated this frame; it is identity mapped
    // and not yet visible to anyone else.
    unsafe { core::ptr::write_bytes(paddr as *mut u8, 0, PAGE_SIZE as usize) };
}

/// Walk `dir` for the PTE mapping `vaddr`, optionally materializing the
/// page table on the way down.
///
/// A freshly created table is zeroed and installed User+Writable so the leaf
/// entry alone decides the effective permission.
fn find_or_create_pte(dir: u32, vaddr: u32, create: bool) -> KernelResult<Option<*mut PageTableEntry>> {
    // SAFETY: dir is a live directory owned by the caller.
    let pde = &mut unsafe { dir_entries(dir) }[pde_index(vaddr)];

    let table = if pde.is_present() {
        pde.table_paddr()
    } else {
        if !create {
            return Ok(None);
        }
        let table = frame_allocator::alloc_page()?;
        zero_frame(table);
        *pde = PageDirEntry::new(
            table,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
        );
        table
    };

    // SAFETY: table was read from a present PDE of a live directory.
    let entry = &mut unsafe { table_entries(table) }[pte_index(vaddr)];
    Ok(Some(entry as *mut PageTableEntry))
}

/// Establish `count` consecutive `vaddr → paddr` mappings in `dir`.
///
/// Panics if any target entry is already present; double-mapping means
/// corrupted kernel state.
pub fn create_map(dir: u32, vaddr: u32, paddr: u32, count: u32, flags: PageFlags) -> KernelResult<()> {
    let mut vaddr = vaddr;
    let mut paddr = paddr;

    for _ in 0..count {
        let pte = match find_or_create_pte(dir, vaddr, true)? {
            Some(pte) => pte,
            None => unreachable!("create walk always yields an entry"),
        };

        // SAFETY: pte points into a live page table of dir.
        unsafe {
            assert!(!(*pte).is_present(), "double mapping of {:#x}", vaddr);
            *pte = PageTableEntry::new(paddr, flags | PageFlags::PRESENT);
        }

        vaddr += PAGE_SIZE;
        paddr += PAGE_SIZE;
    }

    Ok(())
}

/// Handle to one address space, identified by its root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: u32,
}

impl AddressSpace {
    /// Wrap an existing directory (e.g. the one stored in a TSS image).
    pub fn from_root(root: u32) -> Self {
        debug_assert!(root != 0);
        Self { root }
    }

    /// Root directory physical address, as loaded into CR3.
    pub fn root(&self) -> u32 {
        self.root
    }

    /// Create a fresh user address space: empty user window, kernel window
    /// aliased from the canonical kernel directory.
    pub fn new_user() -> KernelResult<Self> {
        let dir = frame_allocator::alloc_page()?;
        zero_frame(dir);

        let kernel_end = pde_index(USER_BASE);
        // SAFETY: dir was just allocated and zeroed; the kernel directory is
        // read-only after init.
        unsafe {
            let entries = dir_entries(dir);
            let kernel = &(*KERNEL_DIR.0.get()).0;
            entries[..kernel_end].copy_from_slice(&kernel[..kernel_end]);
        }

        Ok(Self { root: dir })
    }

    /// Tear down the user window: every present leaf frame, every user page
    /// table, then the directory itself. Kernel-window tables are shared and
    /// untouched.
    pub fn destroy(self) {
        let user_start = pde_index(USER_BASE);

        // SAFETY: the address space is being destroyed; nothing else
        // references it.
        let entries = unsafe { dir_entries(self.root) };
        for pde in entries[user_start..].iter() {
            if !pde.is_present() {
                continue;
            }

            let table = pde.table_paddr();
            // SAFETY: table read from a present PDE of this directory.
            for pte in unsafe { table_entries(table) }.iter() {
                if pte.is_present() {
                    frame_allocator::free_page(pte.frame_paddr());
                }
            }
            frame_allocator::free_page(table);
        }

        frame_allocator::free_page(self.root);
    }

    /// Deep-copy the user window into a new address space.
    ///
    /// Every present source page gets a fresh frame with identical contents
    /// and permission bits. Must run on the source address space (the copy
    /// reads through the source's user-window mappings). On failure,
    /// everything built so far is destroyed.
    pub fn deep_copy(&self) -> KernelResult<Self> {
        let new = Self::new_user()?;

        match self.copy_user_pages(&new) {
            Ok(()) => Ok(new),
            Err(e) => {
                new.destroy();
                Err(e)
            }
        }
    }

    fn copy_user_pages(&self, to: &Self) -> KernelResult<()> {
        let user_start = pde_index(USER_BASE);

        // SAFETY: self.root is the caller's live directory.
        let entries = unsafe { dir_entries(self.root) };
        for (i, pde) in entries.iter().enumerate().skip(user_start) {
            if !pde.is_present() {
                continue;
            }

            // SAFETY: table read from a present PDE.
            let table = unsafe { table_entries(pde.table_paddr()) };
            for (j, pte) in table.iter().enumerate() {
                if !pte.is_present() {
                    continue;
                }

                let page = frame_allocator::alloc_page()?;
                let vaddr = ((i as u32) << 22) | ((j as u32) << 12);
                if let Err(e) = create_map(to.root, vaddr, page, 1, pte.perm()) {
                    frame_allocator::free_page(page);
                    return Err(e);
                }

                // SAFETY: page is a fresh identity-mapped frame; vaddr is a
                // present user mapping of the currently loaded source space.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        vaddr as *const u8,
                        page as *mut u8,
                        PAGE_SIZE as usize,
                    );
                }
            }
        }

        Ok(())
    }

    /// Translate one virtual address; `None` if not mapped.
    pub fn translate(&self, vaddr: u32) -> Option<u32> {
        let pte = find_or_create_pte(self.root, vaddr, false).ok().flatten()?;
        // SAFETY: pte points into a live page table of this space.
        let entry = unsafe { *pte };
        if entry.is_present() {
            Some(entry.frame_paddr() + page_offset(vaddr))
        } else {
            None
        }
    }

    /// Map `count` pages at `vaddr` onto `paddr`.
    pub fn map(&self, vaddr: u32, paddr: u32, count: u32, flags: PageFlags) -> KernelResult<()> {
        create_map(self.root, vaddr, paddr, count, flags)
    }

    /// Allocate frames for `[vaddr, vaddr + size)` and map them.
    ///
    /// `vaddr` is rounded down and `size` up to page granularity. On failure
    /// the pages mapped so far are unmapped and freed.
    pub fn alloc_for(&self, vaddr: u32, size: u32, flags: PageFlags) -> KernelResult<()> {
        let start = page_align_down(vaddr);
        let pages = page_count(size + (vaddr - start));

        for i in 0..pages {
            let vaddr = start + i * PAGE_SIZE;
            let page = match frame_allocator::alloc_page() {
                Ok(page) => page,
                Err(e) => {
                    self.unwind_alloc(start, i);
                    return Err(e);
                }
            };
            if let Err(e) = create_map(self.root, vaddr, page, 1, flags) {
                frame_allocator::free_page(page);
                self.unwind_alloc(start, i);
                return Err(e);
            }
        }

        Ok(())
    }

    fn unwind_alloc(&self, start: u32, pages: u32) {
        for i in 0..pages {
            let vaddr = start + i * PAGE_SIZE;
            if let Ok(Some(pte)) = find_or_create_pte(self.root, vaddr, false) {
                // SAFETY: pte points into a live page table of this space.
                unsafe {
                    if (*pte).is_present() {
                        frame_allocator::free_page((*pte).frame_paddr());
                        (*pte).clear();
                    }
                }
            }
        }
    }

    /// Copy `len` bytes from `src` in the *current* address space to
    /// `dst_vaddr` in this one, honoring page boundaries on the destination.
    ///
    /// Used by `exec` to write the argv image into the child stack before
    /// switching directories. Fails if any destination page is unmapped.
    pub fn copy_to(&self, dst_vaddr: u32, src: *const u8, len: usize) -> KernelResult<()> {
        let mut dst = dst_vaddr;
        let mut src = src;
        let mut remaining = len;

        while remaining > 0 {
            let paddr = self
                .translate(dst)
                .ok_or(crate::error::KernelError::InvalidArgument {
                    what: "unmapped destination address",
                })?;

            let in_page = (PAGE_SIZE - page_offset(paddr)) as usize;
            let chunk = in_page.min(remaining);

            // SAFETY: paddr is identity mapped through the kernel window and
            // chunk stays within its page; src is readable in the current
            // space for len bytes.
            unsafe { core::ptr::copy_nonoverlapping(src, paddr as *mut u8, chunk) };

            remaining -= chunk;
            dst += chunk as u32;
            // SAFETY: advancing within the source buffer.
            src = unsafe { src.add(chunk) };
        }

        Ok(())
    }
}
