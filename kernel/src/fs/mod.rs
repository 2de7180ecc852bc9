//! Virtual filesystem layer
//!
//! A small mount table routes paths to filesystem instances by longest
//! mount-point prefix (falling back to the root filesystem), and the
//! POSIX-shaped file calls bridge per-task descriptors to the backend
//! drivers. Each mount carries an optional serialization mutex taken
//! around every operation on it.

pub mod blockdev;
pub mod devfs;
pub mod fat16;
pub mod file;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::process::table;
use crate::sched::sync::KMutex;

use file::{File, FileId, FileType, OpenFlags};

/// Mounted filesystems, at most
const MOUNT_MAX: usize = 10;

/// Mount-point path length
const MOUNT_POINT_LEN: usize = 32;

/// Directory-entry name field length (user ABI)
pub const DIRENT_NAME_LEN: usize = 255;

/// One directory entry as reported to user space.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Dirent {
    pub index: i32,
    pub dtype: i32,
    pub name: [u8; DIRENT_NAME_LEN],
    pub size: i32,
}

impl Dirent {
    pub const fn empty() -> Self {
        Self {
            index: 0,
            dtype: 0,
            name: [0; DIRENT_NAME_LEN],
            size: 0,
        }
    }
}

/// Directory iterator handed to user space: a cursor plus scratch entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Dir {
    pub index: i32,
    pub dirent: Dirent,
}

impl Dir {
    pub const fn empty() -> Self {
        Self {
            index: 0,
            dirent: Dirent::empty(),
        }
    }
}

/// Minimal stat record; the backends here report nothing richer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub st_mode: u32,
    pub st_size: u32,
    pub st_blocks: u32,
}

impl Stat {
    pub const fn zeroed() -> Self {
        Self {
            st_mode: 0,
            st_size: 0,
            st_blocks: 0,
        }
    }
}

/// Operation vtable every filesystem backend implements.
pub trait FileSystem {
    fn open(&mut self, path: &str, file: &mut File) -> KernelResult<()>;
    fn read(&mut self, buf: &mut [u8], file: &mut File) -> KernelResult<usize>;
    fn write(&mut self, buf: &[u8], file: &mut File) -> KernelResult<usize>;
    fn seek(&mut self, file: &mut File, offset: u32, whence: u32) -> KernelResult<()>;
    fn stat(&mut self, file: &File, st: &mut Stat) -> KernelResult<()>;
    fn close(&mut self, file: &mut File) -> KernelResult<()>;

    fn ioctl(&mut self, _file: &mut File, _cmd: i32, _arg0: u32, _arg1: u32) -> KernelResult<i32> {
        Err(KernelError::NotSupported)
    }

    fn opendir(&mut self, path: &str, dir: &mut Dir) -> KernelResult<()>;
    fn readdir(&mut self, dir: &mut Dir, out: &mut Dirent) -> KernelResult<()>;
    fn closedir(&mut self, dir: &mut Dir) -> KernelResult<()>;
    fn unlink(&mut self, path: &str) -> KernelResult<()>;
}

/// The mountable backends.
pub enum FsInstance {
    Fat16(fat16::Fat16Fs<blockdev::RegistryDisk>),
    Dev(devfs::DevFs),
}

impl FsInstance {
    fn as_ops(&mut self) -> &mut dyn FileSystem {
        match self {
            Self::Fat16(fs) => fs,
            Self::Dev(fs) => fs,
        }
    }
}

struct MountMeta {
    used: bool,
    point: [u8; MOUNT_POINT_LEN],
    point_len: usize,
    serialized: bool,
}

struct MountSlot {
    meta: UnsafeCell<MountMeta>,
    mutex: KMutex,
    fs: UnsafeCell<Option<FsInstance>>,
}

// SAFETY: meta and fs are written only while mounting (under MOUNT_REG and
// before the mount becomes visible); afterwards meta is read-only and fs is
// serialized by the slot mutex.
unsafe impl Sync for MountSlot {}

static MOUNTS: [MountSlot; MOUNT_MAX] = [const {
    MountSlot {
        meta: UnsafeCell::new(MountMeta {
            used: false,
            point: [0; MOUNT_POINT_LEN],
            point_len: 0,
            serialized: false,
        }),
        mutex: KMutex::new(),
        fs: UnsafeCell::new(None),
    }
}; MOUNT_MAX];

/// Serializes mount-table registration.
static MOUNT_REG: spin::Mutex<()> = spin::Mutex::new(());

/// Root filesystem slot; MOUNT_MAX means "none yet".
static ROOT_SLOT: AtomicUsize = AtomicUsize::new(MOUNT_MAX);

/// Install a filesystem at `point`. `serialized` mounts take their mutex
/// around every operation.
pub fn mount(point: &str, instance: FsInstance, serialized: bool) -> KernelResult<usize> {
    let _reg = MOUNT_REG.lock();

    if point.len() >= MOUNT_POINT_LEN {
        return Err(KernelError::InvalidArgument {
            what: "mount point too long",
        });
    }

    let mut free = None;
    for (i, slot) in MOUNTS.iter().enumerate() {
        // SAFETY: MOUNT_REG held.
        let meta = unsafe { &*slot.meta.get() };
        if meta.used {
            if &meta.point[..meta.point_len] == point.as_bytes() {
                log::warn!("{} is already mounted", point);
                return Err(KernelError::InvalidArgument {
                    what: "mount point in use",
                });
            }
        } else if free.is_none() {
            free = Some(i);
        }
    }

    let index = free.ok_or(KernelError::TableFull { table: "mount" })?;
    let slot = &MOUNTS[index];

    // SAFETY: MOUNT_REG held and the slot is unused, so nobody reads it.
    unsafe {
        *slot.fs.get() = Some(instance);
        let meta = &mut *slot.meta.get();
        meta.point[..point.len()].copy_from_slice(point.as_bytes());
        meta.point_len = point.len();
        meta.serialized = serialized;
        meta.used = true;
    }

    log::info!("mounted {}", point);
    Ok(index)
}

fn set_root(slot: usize) {
    ROOT_SLOT.store(slot, Ordering::Release);
}

fn root_slot() -> KernelResult<usize> {
    let slot = ROOT_SLOT.load(Ordering::Acquire);
    if slot >= MOUNT_MAX {
        return Err(KernelError::NotFound);
    }
    Ok(slot)
}

/// True when `path` begins with `prefix` at a component boundary.
fn path_begin_with(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Drop the leading component: `/dev/tty0` → `tty0`, `/home` → ``.
fn path_next_child(path: &str) -> &str {
    let trimmed = path.trim_start_matches('/');
    match trimmed.find('/') {
        Some(at) => trimmed[at..].trim_start_matches('/'),
        None => "",
    }
}

/// Find the mount owning `path`: longest matching mount-point prefix, or
/// the root filesystem with the path unchanged.
fn resolve(path: &str) -> KernelResult<(usize, &str)> {
    let mut best: Option<(usize, usize)> = None;

    for (i, slot) in MOUNTS.iter().enumerate() {
        // SAFETY: meta is immutable once the mount is visible.
        let meta = unsafe { &*slot.meta.get() };
        if !meta.used {
            continue;
        }
        let point = core::str::from_utf8(&meta.point[..meta.point_len]).unwrap_or("");
        if path_begin_with(path, point) && best.map_or(true, |(_, len)| point.len() > len) {
            best = Some((i, point.len()));
        }
    }

    match best {
        Some((slot, _)) => Ok((slot, path_next_child(path))),
        None => Ok((root_slot()?, path)),
    }
}

/// Run one operation against a mounted filesystem, taking its
/// serialization mutex when it has one.
fn with_fs<R>(slot: usize, f: impl FnOnce(&mut dyn FileSystem) -> KernelResult<R>) -> KernelResult<R> {
    let mount = &MOUNTS[slot];
    // SAFETY: meta is immutable once the mount is visible.
    let serialized = unsafe { &*mount.meta.get() }.serialized;

    if serialized {
        mount.mutex.lock();
    }

    // SAFETY: either the slot mutex is held or the backend tolerates
    // concurrent entry (devfs, which only forwards to the registry).
    let result = match unsafe { &mut *mount.fs.get() } {
        Some(instance) => f(instance.as_ops()),
        None => Err(KernelError::NotFound),
    };

    if serialized {
        mount.mutex.unlock();
    }
    result
}

fn current_task_file(fd: usize) -> KernelResult<FileId> {
    let id = crate::process::current_task()?;
    // SAFETY: reading the caller's own TCB.
    unsafe { table::task_mut(id) }
        .file(fd)
        .ok_or(KernelError::BadFileDescriptor)
}

/// Mount the standard namespace: devfs at /dev, FAT16 root at /home.
///
/// The disk root device is the second drive's first MBR partition.
pub fn init() -> KernelResult<()> {
    const ROOT_DEV_MINOR: u32 = 0xb1; // sdb1

    crate::drivers::ata::register();
    #[cfg(target_arch = "x86")]
    crate::drivers::ata::init();

    mount("/dev", FsInstance::Dev(devfs::DevFs::new()), false)?;

    let dev_id = crate::drivers::dev_open(crate::drivers::DevMajor::Disk, ROOT_DEV_MINOR)?;
    let fat = fat16::Fat16Fs::mount(blockdev::RegistryDisk::new(dev_id))?;
    let slot = mount("/home", FsInstance::Fat16(fat), true)?;
    set_root(slot);

    Ok(())
}

/// Open `path`, returning a new descriptor for the calling task.
pub fn open(path: &str, flags: OpenFlags) -> KernelResult<usize> {
    let fid = file::alloc()?;

    let task_id = match crate::process::current_task() {
        Ok(id) => id,
        Err(e) => {
            file::release(fid);
            return Err(e);
        }
    };
    // SAFETY: the caller's own TCB.
    let task = unsafe { table::task_mut(task_id) };
    let Some(fd) = task.alloc_fd(fid) else {
        file::release(fid);
        return Err(KernelError::TableFull {
            table: "descriptor",
        });
    };

    let result = (|| {
        let (slot, remainder) = resolve(path)?;

        let mut f = file::get(fid);
        f.mode = flags;
        f.fs_slot = Some(slot);
        f.set_name(remainder);

        with_fs(slot, |fs| fs.open(remainder, &mut f))?;
        file::put(fid, &f);
        Ok(fd)
    })();

    if result.is_err() {
        task.remove_fd(fd);
        file::release(fid);
    }
    result
}

/// Read from an open descriptor.
pub fn read(fd: usize, buf: &mut [u8]) -> KernelResult<usize> {
    let fid = current_task_file(fd)?;
    let mut f = file::get(fid);

    if !f.mode.readable() {
        log::debug!("read on a write-only descriptor");
        return Err(KernelError::InvalidArgument {
            what: "write-only descriptor",
        });
    }

    let slot = f.fs_slot.ok_or(KernelError::BadFileDescriptor)?;
    let n = with_fs(slot, |fs| fs.read(buf, &mut f))?;
    file::put(fid, &f);
    Ok(n)
}

/// Write to an open descriptor.
pub fn write(fd: usize, buf: &[u8]) -> KernelResult<usize> {
    let fid = current_task_file(fd)?;
    let mut f = file::get(fid);

    if !f.mode.writable() {
        log::debug!("write on a read-only descriptor");
        return Err(KernelError::InvalidArgument {
            what: "read-only descriptor",
        });
    }

    let slot = f.fs_slot.ok_or(KernelError::BadFileDescriptor)?;
    let n = with_fs(slot, |fs| fs.write(buf, &mut f))?;
    file::put(fid, &f);
    Ok(n)
}

/// Reposition an open descriptor (origin 0 only, per the backends).
pub fn lseek(fd: usize, offset: u32, whence: u32) -> KernelResult<()> {
    let fid = current_task_file(fd)?;
    let mut f = file::get(fid);

    let slot = f.fs_slot.ok_or(KernelError::BadFileDescriptor)?;
    with_fs(slot, |fs| fs.seek(&mut f, offset, whence))?;
    file::put(fid, &f);
    Ok(())
}

/// Close a descriptor; the backend close runs when the last reference to
/// the file record drops.
pub fn close(fd: usize) -> KernelResult<()> {
    let fid = current_task_file(fd)?;
    let mut f = file::get(fid);

    let remaining = file::release(fid);
    if remaining == 0 {
        if let Some(slot) = f.fs_slot {
            let _ = with_fs(slot, |fs| fs.close(&mut f));
        }
    }

    let task_id = crate::process::current_task()?;
    // SAFETY: the caller's own TCB.
    unsafe { table::task_mut(task_id) }.remove_fd(fd);
    Ok(())
}

/// Is the descriptor a terminal?
pub fn isatty(fd: usize) -> bool {
    match current_task_file(fd) {
        Ok(fid) => file::get(fid).ftype == FileType::Tty,
        Err(_) => false,
    }
}

/// File status; zeroed output even when the backend reports nothing.
pub fn fstat(fd: usize, st: &mut Stat) -> KernelResult<()> {
    let fid = current_task_file(fd)?;
    let f = file::get(fid);

    *st = Stat::zeroed();
    let slot = f.fs_slot.ok_or(KernelError::BadFileDescriptor)?;
    with_fs(slot, |fs| fs.stat(&f, st))
}

/// Duplicate a descriptor; both share one file record and position.
pub fn dup(fd: usize) -> KernelResult<usize> {
    let fid = current_task_file(fd)?;

    let task_id = crate::process::current_task()?;
    // SAFETY: the caller's own TCB.
    let task = unsafe { table::task_mut(task_id) };
    let new_fd = task.alloc_fd(fid).ok_or(KernelError::TableFull {
        table: "descriptor",
    })?;
    file::inc_ref(fid);
    Ok(new_fd)
}

/// Device control on an open descriptor.
pub fn ioctl(fd: usize, cmd: i32, arg0: u32, arg1: u32) -> KernelResult<i32> {
    let fid = current_task_file(fd)?;
    let mut f = file::get(fid);

    let slot = f.fs_slot.ok_or(KernelError::BadFileDescriptor)?;
    let v = with_fs(slot, |fs| fs.ioctl(&mut f, cmd, arg0, arg1))?;
    file::put(fid, &f);
    Ok(v)
}

/// Start a directory iteration.
pub fn opendir(path: &str, dir: &mut Dir) -> KernelResult<()> {
    let (slot, remainder) = resolve(path)?;
    with_fs(slot, |fs| fs.opendir(remainder, dir))
}

/// Yield the next directory entry from the root filesystem.
pub fn readdir(dir: &mut Dir, out: &mut Dirent) -> KernelResult<()> {
    let slot = root_slot()?;
    with_fs(slot, |fs| fs.readdir(dir, out))
}

/// Finish a directory iteration.
pub fn closedir(dir: &mut Dir) -> KernelResult<()> {
    let slot = root_slot()?;
    with_fs(slot, |fs| fs.closedir(dir))
}

/// Remove a file by path.
pub fn unlink(path: &str) -> KernelResult<()> {
    let (slot, remainder) = resolve(path)?;
    with_fs(slot, |fs| fs.unlink(remainder))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching_respects_component_boundaries() {
        assert!(path_begin_with("/dev/tty0", "/dev"));
        assert!(path_begin_with("/dev", "/dev"));
        assert!(!path_begin_with("/devices/tty0", "/dev"));
        assert!(!path_begin_with("/home/a.txt", "/dev"));
    }

    #[test]
    fn next_child_strips_the_mount_component() {
        assert_eq!(path_next_child("/dev/tty0"), "tty0");
        assert_eq!(path_next_child("/home/a.txt"), "a.txt");
        assert_eq!(path_next_child("/home"), "");
        assert_eq!(path_next_child("/a/b/c"), "b/c");
    }
}
