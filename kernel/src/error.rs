//! Kernel-wide error types
//!
//! Every fallible kernel operation returns [`KernelResult`]; the syscall
//! dispatcher is the single place where errors collapse to `-1`.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frames, page tables, task slots or GDT slots exhausted
    OutOfMemory {
        resource: &'static str,
    },
    /// Path lookup miss (open/unlink)
    NotFound,
    /// FAT cluster exhaustion
    NoSpace,
    /// Bad argument: unsupported seek origin, malformed path, bad syscall id
    InvalidArgument {
        what: &'static str,
    },
    /// Disk reported the ERR status bit
    Io,
    /// File descriptor out of range or not open
    BadFileDescriptor,
    /// Operation not supported by this filesystem or device
    NotSupported,
    /// A fixed table (mount table, file table, open-device table) is full
    TableFull {
        table: &'static str,
    },
    /// ELF image failed validation
    BadExecutable,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { resource } => write!(f, "out of memory: {}", resource),
            Self::NotFound => write!(f, "no such file or directory"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::InvalidArgument { what } => write!(f, "invalid argument: {}", what),
            Self::Io => write!(f, "I/O error"),
            Self::BadFileDescriptor => write!(f, "bad file descriptor"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::TableFull { table } => write!(f, "{} table full", table),
            Self::BadExecutable => write!(f, "bad executable image"),
        }
    }
}
