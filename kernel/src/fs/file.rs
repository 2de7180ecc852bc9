//! Global open-file table
//!
//! A fixed arena of reference-counted file records; descriptors in the
//! per-task fd tables are indices into it, shared across `fork` and `dup`.
//! The record is freed exactly when the last reference drops.

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};
use crate::sched::sync::KLock;

/// Openable files, system wide
pub const FILE_CAPACITY: usize = 2048;

/// Stored file-name length
pub const FILE_NAME_LEN: usize = 32;

bitflags! {
    /// Open mode. Read-only is the absence of both write bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 1 << 0;
        const RDWR = 1 << 1;
        const CREAT = 0x0200;
        const TRUNC = 0x0400;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        !self.contains(Self::WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

/// Index into the global file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FileType {
    Unknown = 0,
    Tty = 1,
    Regular = 2,
    Directory = 3,
}

/// One open file. Copied out of the table for the duration of an operation
/// (the owning filesystem's mutex serializes those), then written back.
#[derive(Debug, Clone, Copy)]
pub struct File {
    pub name: [u8; FILE_NAME_LEN],
    pub ftype: FileType,
    pub size: u32,
    pub pos: u32,
    pub mode: OpenFlags,

    /// Owning mount-table slot
    pub fs_slot: Option<usize>,
    /// Open device-registry entry (devfs files)
    pub dev_id: Option<usize>,

    /// First cluster of the chain (FAT)
    pub start_cluster: u16,
    /// Cluster the position currently falls in (FAT)
    pub cur_cluster: u16,
    /// Directory-entry index in the parent (FAT)
    pub dir_index: u32,
}

impl File {
    pub const fn empty() -> Self {
        Self {
            name: [0; FILE_NAME_LEN],
            ftype: FileType::Unknown,
            size: 0,
            pos: 0,
            mode: OpenFlags::empty(),
            fs_slot: None,
            dev_id: None,
            start_cluster: 0,
            cur_cluster: 0,
            dir_index: 0,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; FILE_NAME_LEN];
        let bytes = name.as_bytes();
        let take = bytes.len().min(FILE_NAME_LEN - 1);
        self.name[..take].copy_from_slice(&bytes[..take]);
    }
}

struct Slot {
    refs: u16,
    file: File,
}

/// The arena. Instantiable for tests; the kernel uses one global instance.
pub struct FileTable {
    slots: [Slot; FILE_CAPACITY],
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            slots: [const {
                Slot {
                    refs: 0,
                    file: File::empty(),
                }
            }; FILE_CAPACITY],
        }
    }

    pub fn alloc(&mut self) -> KernelResult<FileId> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.refs == 0 {
                slot.refs = 1;
                slot.file = File::empty();
                return Ok(FileId(i as u16));
            }
        }
        Err(KernelError::TableFull { table: "file" })
    }

    pub fn inc_ref(&mut self, id: FileId) {
        let slot = &mut self.slots[id.0 as usize];
        debug_assert!(slot.refs > 0);
        slot.refs += 1;
    }

    /// Drop one reference; returns how many remain (0 = record freed).
    pub fn release(&mut self, id: FileId) -> u16 {
        let slot = &mut self.slots[id.0 as usize];
        debug_assert!(slot.refs > 0);
        slot.refs -= 1;
        if slot.refs == 0 {
            slot.file = File::empty();
        }
        slot.refs
    }

    pub fn refs(&self, id: FileId) -> u16 {
        self.slots[id.0 as usize].refs
    }

    pub fn get(&self, id: FileId) -> File {
        self.slots[id.0 as usize].file
    }

    pub fn put(&mut self, id: FileId, file: &File) {
        self.slots[id.0 as usize].file = *file;
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.refs > 0).count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

static FILE_TABLE: KLock<FileTable> = KLock::new(FileTable::new());

/// Allocate a record with one reference.
pub fn alloc() -> KernelResult<FileId> {
    FILE_TABLE.lock().alloc()
}

/// Add a reference (fork, dup).
pub fn inc_ref(id: FileId) {
    FILE_TABLE.lock().inc_ref(id);
}

/// Drop a reference; returns the remaining count.
pub fn release(id: FileId) -> u16 {
    FILE_TABLE.lock().release(id)
}

/// Snapshot a record for an operation.
pub fn get(id: FileId) -> File {
    FILE_TABLE.lock().get(id)
}

/// Write a record back after an operation.
pub fn put(id: FileId, file: &File) {
    FILE_TABLE.lock().put(id, file);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn open_flags_access_bits() {
        assert!(OpenFlags::empty().readable());
        assert!(!OpenFlags::empty().writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::WRONLY.writable());
        assert!(OpenFlags::RDWR.readable());
        assert!(OpenFlags::RDWR.writable());
        assert!((OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY).writable());
    }

    #[test]
    fn alloc_release_lifecycle() {
        let mut table = FileTable::new();
        let id = table.alloc().unwrap();
        assert_eq!(table.refs(id), 1);

        table.inc_ref(id);
        assert_eq!(table.refs(id), 2);

        assert_eq!(table.release(id), 1);
        assert_eq!(table.release(id), 0);
        assert_eq!(table.refs(id), 0);
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn freed_slot_is_reused_clean() {
        let mut table = FileTable::new();
        let id = table.alloc().unwrap();

        let mut file = table.get(id);
        file.set_name("a.txt");
        file.size = 123;
        table.put(id, &file);

        table.release(id);
        let id2 = table.alloc().unwrap();
        assert_eq!(id, id2);
        assert_eq!(table.get(id2).size, 0, "record reset on reuse");
    }

    #[test]
    fn exhaustion_reports_table_full() {
        let mut table = FileTable::new();
        for _ in 0..FILE_CAPACITY {
            table.alloc().unwrap();
        }
        assert_eq!(
            table.alloc(),
            Err(KernelError::TableFull { table: "file" })
        );
    }
}
