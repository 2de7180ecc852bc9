//! Task control block
//!
//! One fixed-size record per task slot in the arena. The pid combines the
//! slot index with a generation counter so it stays unique across slot
//! reuse; list membership is expressed through the embedded index nodes.

use crate::arch::tss::TaskStateSegment;
use crate::fs::file::FileId;
use crate::sched::queue::ListNode;

/// Task name buffer length
pub const TASK_NAME_LEN: usize = 32;

/// Per-task open-file slots
pub const TASK_FILES_MAX: usize = 128;

/// Fresh time slice, in timer ticks
pub const TASK_TIME_SLICE_DEFAULT: u32 = 10;

/// Arena slot index of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub u16);

/// Lifecycle states, plus the free-slot marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Unused arena slot
    Free,
    Created,
    Ready,
    Running,
    Sleep,
    /// Blocked in wait() until a child exits
    Waiting,
    /// Parked on a mutex or semaphore wait list
    Blocked,
    Zombie,
}

/// Task control block.
pub struct Task {
    pub state: TaskState,
    pub name: [u8; TASK_NAME_LEN],
    /// Unique per lifetime: generation in the high bits, slot in the low byte
    pub pid: u32,
    pub parent: Option<TaskId>,

    pub heap_start: u32,
    pub heap_end: u32,
    pub exit_status: i32,

    pub sleep_ticks: u32,
    pub time_slice: u32,
    pub slice_ticks: u32,

    pub files: [Option<FileId>; TASK_FILES_MAX],

    /// Hardware task-switch image; `tss.cr3` is the address-space root
    pub tss: TaskStateSegment,
    pub tss_sel: u16,

    pub run_node: ListNode,
    pub wait_node: ListNode,
    pub all_node: ListNode,
}

impl Task {
    pub const fn empty() -> Self {
        Self {
            state: TaskState::Free,
            name: [0; TASK_NAME_LEN],
            pid: 0,
            parent: None,
            heap_start: 0,
            heap_end: 0,
            exit_status: 0,
            sleep_ticks: 0,
            time_slice: TASK_TIME_SLICE_DEFAULT,
            slice_ticks: TASK_TIME_SLICE_DEFAULT,
            files: [None; TASK_FILES_MAX],
            tss: TaskStateSegment::zeroed(),
            tss_sel: 0,
            run_node: ListNode::new(),
            wait_node: ListNode::new(),
            all_node: ListNode::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self.state, TaskState::Free)
    }

    /// Copy `name` in, truncated to the buffer, NUL padded.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; TASK_NAME_LEN];
        let bytes = name.as_bytes();
        let take = bytes.len().min(TASK_NAME_LEN - 1);
        self.name[..take].copy_from_slice(&bytes[..take]);
    }

    /// Name as a str, up to the first NUL.
    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }

    /// Allocate a descriptor slot for `file`.
    pub fn alloc_fd(&mut self, file: FileId) -> Option<usize> {
        for (fd, slot) in self.files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Some(fd);
            }
        }
        None
    }

    /// Look up an open descriptor.
    pub fn file(&self, fd: usize) -> Option<FileId> {
        self.files.get(fd).copied().flatten()
    }

    /// Drop a descriptor slot (the file's refcount is the caller's business).
    pub fn remove_fd(&mut self, fd: usize) {
        if let Some(slot) = self.files.get_mut(fd) {
            *slot = None;
        }
    }
}

/// Compose a pid from slot + generation.
pub fn make_pid(slot: TaskId, generation: u32) -> u32 {
    (generation << 8) | slot.0 as u32
}

/// Slot index encoded in a pid.
pub fn pid_slot(pid: u32) -> TaskId {
    TaskId((pid & 0xFF) as u16)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip_and_truncation() {
        let mut task = Task::empty();
        task.set_name("shell");
        assert_eq!(task.name(), "shell");

        task.set_name("a-name-way-longer-than-the-thirty-two-byte-buffer");
        assert_eq!(task.name().len(), TASK_NAME_LEN - 1);
    }

    #[test]
    fn fd_slots_allocate_lowest_first() {
        let mut task = Task::empty();
        assert_eq!(task.alloc_fd(FileId(7)), Some(0));
        assert_eq!(task.alloc_fd(FileId(8)), Some(1));
        task.remove_fd(0);
        assert_eq!(task.alloc_fd(FileId(9)), Some(0));
        assert_eq!(task.file(0), Some(FileId(9)));
        assert_eq!(task.file(1), Some(FileId(8)));
        assert_eq!(task.file(99), None);
    }

    #[test]
    fn pid_encodes_slot_and_generation() {
        let pid = make_pid(TaskId(17), 3);
        assert_eq!(pid_slot(pid), TaskId(17));
        let reused = make_pid(TaskId(17), 4);
        assert_ne!(pid, reused);
        assert_eq!(pid_slot(reused), TaskId(17));
    }
}
