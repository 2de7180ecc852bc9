//! Two-level 32-bit page-table entries
//!
//! Classical non-PAE paging: a 1024-entry page directory of 4 KiB-aligned
//! tables, 4 KiB leaves. Entry types are `u32` newtypes; nothing here
//! touches memory, so the arithmetic is fully host-testable.

use bitflags::bitflags;

/// Entries per directory or table
pub const ENTRY_COUNT: usize = 1024;

/// Size of one page / frame
pub const PAGE_SIZE: u32 = 4096;

bitflags! {
    /// Attribute bits shared by directory and table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const LARGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

/// Mask of the bits `perm()` preserves when copying a mapping
const PERM_MASK: u32 = 0x1FF;

/// One page-directory entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDirEntry(u32);

/// One page-table entry.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u32);

impl PageDirEntry {
    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn new(table_paddr: u32, flags: PageFlags) -> Self {
        debug_assert_eq!(table_paddr % PAGE_SIZE, 0);
        Self(table_paddr | flags.bits())
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// Physical address of the referenced page table.
    pub fn table_paddr(self) -> u32 {
        self.0 & !(PAGE_SIZE - 1)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl PageTableEntry {
    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn new(frame_paddr: u32, flags: PageFlags) -> Self {
        debug_assert_eq!(frame_paddr % PAGE_SIZE, 0);
        Self(frame_paddr | flags.bits())
    }

    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// Physical address of the mapped frame.
    pub fn frame_paddr(self) -> u32 {
        self.0 & !(PAGE_SIZE - 1)
    }

    /// Attribute bits, preserved verbatim across a deep copy.
    pub fn perm(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & PERM_MASK)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Directory index of a virtual address (top 10 bits).
pub const fn pde_index(vaddr: u32) -> usize {
    (vaddr >> 22) as usize
}

/// Table index of a virtual address (middle 10 bits).
pub const fn pte_index(vaddr: u32) -> usize {
    ((vaddr >> 12) & 0x3FF) as usize
}

/// Offset within the page (low 12 bits).
pub const fn page_offset(vaddr: u32) -> u32 {
    vaddr & (PAGE_SIZE - 1)
}

pub const fn page_align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

pub const fn page_align_up(addr: u32) -> u32 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Pages needed to cover `size` bytes.
pub const fn page_count(size: u32) -> u32 {
    page_align_up(size) / PAGE_SIZE
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn index_split() {
        let vaddr = 0x8040_2ABC;
        assert_eq!(pde_index(vaddr), 0x201);
        assert_eq!(pte_index(vaddr), 0x002);
        assert_eq!(page_offset(vaddr), 0xABC);
        // Recombine
        let rebuilt = ((pde_index(vaddr) as u32) << 22)
            | ((pte_index(vaddr) as u32) << 12)
            | page_offset(vaddr);
        assert_eq!(rebuilt, vaddr);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(page_align_down(0x1FFF), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn entry_roundtrip() {
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        let pte = PageTableEntry::new(0x0030_5000, flags);
        assert!(pte.is_present());
        assert_eq!(pte.frame_paddr(), 0x0030_5000);
        assert_eq!(pte.perm(), flags);

        let pde = PageDirEntry::new(0x0001_0000, flags);
        assert_eq!(pde.table_paddr(), 0x0001_0000);
        assert!(pde.is_present());
    }

    #[test]
    fn perm_preserves_attribute_bits_only() {
        let pte = PageTableEntry::new(
            0x0000_4000,
            PageFlags::PRESENT | PageFlags::DIRTY | PageFlags::ACCESSED,
        );
        assert_eq!(
            pte.perm(),
            PageFlags::PRESENT | PageFlags::DIRTY | PageFlags::ACCESSED
        );
    }
}
