//! System-call dispatch
//!
//! User code traps through a call gate that copies five argument words (the
//! call id plus four arguments); the assembly entry stub saves the register
//! file into a [`SyscallFrame`] on the task's kernel stack and calls
//! [`dispatch`]. The handler's return value is written into the frame's
//! `eax` and travels back on the interrupt return. Unknown ids are logged
//! and return −1, as does every kernel error.

use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::process;
use crate::sched;

/// Argument words the call gate copies to the kernel stack: id + 4 args.
pub const SYSCALL_ARG_WORDS: u32 = 5;

/// Register file saved by the syscall entry stub, top of the kernel stack.
///
/// Layout must match the assembly push order exactly.
#[repr(C)]
pub struct SyscallFrame {
    pub eflags: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub dummy_esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub func_id: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub arg3: u32,
    pub esp: u32,
    pub ss: u32,
}

/// System-call numbers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallId {
    Msleep = 0,
    GetPid = 1,
    PrintMsg = 2,
    Fork = 3,
    Execve = 4,
    Yield = 5,
    Wait = 6,
    Exit = 7,

    Open = 10,
    Read = 11,
    Write = 12,
    Close = 13,
    Lseek = 14,
    IsaTty = 15,
    Sbrk = 16,
    Fstat = 17,
    Dup = 18,
    Ioctl = 19,
    OpenDir = 20,
    ReadDir = 21,
    CloseDir = 22,
    Unlink = 23,
}

impl TryFrom<u32> for SyscallId {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Msleep),
            1 => Ok(Self::GetPid),
            2 => Ok(Self::PrintMsg),
            3 => Ok(Self::Fork),
            4 => Ok(Self::Execve),
            5 => Ok(Self::Yield),
            6 => Ok(Self::Wait),
            7 => Ok(Self::Exit),
            10 => Ok(Self::Open),
            11 => Ok(Self::Read),
            12 => Ok(Self::Write),
            13 => Ok(Self::Close),
            14 => Ok(Self::Lseek),
            15 => Ok(Self::IsaTty),
            16 => Ok(Self::Sbrk),
            17 => Ok(Self::Fstat),
            18 => Ok(Self::Dup),
            19 => Ok(Self::Ioctl),
            20 => Ok(Self::OpenDir),
            21 => Ok(Self::ReadDir),
            22 => Ok(Self::CloseDir),
            23 => Ok(Self::Unlink),
            _ => Err(()),
        }
    }
}

/// Install the call gate. Called once at boot with the address of the
/// assembly entry stub (provided by the platform interrupt glue).
#[cfg(target_arch = "x86")]
pub fn init(entry_stub: u32) {
    crate::arch::x86::gdt::install_syscall_gate(entry_stub, SYSCALL_ARG_WORDS as u8);
}

/// Central dispatcher: routes one trap, writes the result into `eax`.
pub extern "C" fn dispatch(frame: &mut SyscallFrame) {
    let ret = match SyscallId::try_from(frame.func_id) {
        Ok(id) => match handle(id, frame) {
            Ok(value) => value as i32,
            Err(e) => {
                log::debug!("syscall {} failed: {}", frame.func_id, e);
                -1
            }
        },
        Err(()) => {
            log::warn!("unknown syscall id {}", frame.func_id);
            -1
        }
    };
    frame.eax = ret as u32;
}

fn handle(id: SyscallId, frame: &mut SyscallFrame) -> KernelResult<u32> {
    match id {
        SyscallId::Msleep => {
            sched::msleep(frame.arg0);
            Ok(0)
        }
        SyscallId::GetPid => process::getpid(),
        SyscallId::PrintMsg => {
            let mut buf = [0u8; 256];
            let msg = user_cstr(frame.arg0 as *const u8, &mut buf)?;
            log::info!("{} {}", msg, frame.arg1 as i32);
            Ok(0)
        }
        SyscallId::Fork => process::fork(),
        SyscallId::Execve => {
            // arg2 (envp) is accepted and ignored
            process::execve(frame.arg0 as *const u8, frame.arg1 as *const *const u8)
        }
        SyscallId::Yield => {
            sched::yield_now();
            Ok(0)
        }
        SyscallId::Wait => {
            let (pid, status) = process::wait()?;
            let status_out = frame.arg0 as *mut i32;
            if !status_out.is_null() {
                // SAFETY: user out-pointer, valid in the caller's space.
                unsafe { *status_out = status };
            }
            Ok(pid)
        }
        SyscallId::Exit => {
            process::exit(frame.arg0 as i32);
            // Only reached on hosts without a real task switch
            Ok(0)
        }

        SyscallId::Open => {
            let mut buf = [0u8; 128];
            let path = user_cstr(frame.arg0 as *const u8, &mut buf)?;
            let flags = fs::file::OpenFlags::from_bits_truncate(frame.arg1);
            fs::open(path, flags).map(|fd| fd as u32)
        }
        SyscallId::Read => {
            let buf = user_bytes_mut(frame.arg1 as *mut u8, frame.arg2 as usize)?;
            fs::read(frame.arg0 as usize, buf).map(|n| n as u32)
        }
        SyscallId::Write => {
            let buf = user_bytes(frame.arg1 as *const u8, frame.arg2 as usize)?;
            fs::write(frame.arg0 as usize, buf).map(|n| n as u32)
        }
        SyscallId::Close => fs::close(frame.arg0 as usize).map(|()| 0),
        SyscallId::Lseek => {
            fs::lseek(frame.arg0 as usize, frame.arg1, frame.arg2).map(|()| 0)
        }
        SyscallId::IsaTty => Ok(fs::isatty(frame.arg0 as usize) as u32),
        SyscallId::Sbrk => process::sbrk(frame.arg0 as i32),
        SyscallId::Fstat => {
            let st = frame.arg1 as *mut fs::Stat;
            if st.is_null() {
                return Err(KernelError::InvalidArgument {
                    what: "null stat pointer",
                });
            }
            // SAFETY: user out-pointer, valid in the caller's space.
            fs::fstat(frame.arg0 as usize, unsafe { &mut *st }).map(|()| 0)
        }
        SyscallId::Dup => fs::dup(frame.arg0 as usize).map(|fd| fd as u32),
        SyscallId::Ioctl => fs::ioctl(
            frame.arg0 as usize,
            frame.arg1 as i32,
            frame.arg2,
            frame.arg3,
        )
        .map(|v| v as u32),

        SyscallId::OpenDir => {
            let mut buf = [0u8; 128];
            let path = user_cstr(frame.arg0 as *const u8, &mut buf)?;
            let dir = frame.arg1 as *mut fs::Dir;
            if dir.is_null() {
                return Err(KernelError::InvalidArgument {
                    what: "null DIR pointer",
                });
            }
            // SAFETY: user out-pointer, valid in the caller's space.
            fs::opendir(path, unsafe { &mut *dir }).map(|()| 0)
        }
        SyscallId::ReadDir => {
            let dir = frame.arg0 as *mut fs::Dir;
            let entry = frame.arg1 as *mut fs::Dirent;
            if dir.is_null() || entry.is_null() {
                return Err(KernelError::InvalidArgument {
                    what: "null readdir pointer",
                });
            }
            // SAFETY: user pointers, valid in the caller's space.
            unsafe { fs::readdir(&mut *dir, &mut *entry) }.map(|()| 0)
        }
        SyscallId::CloseDir => {
            let dir = frame.arg0 as *mut fs::Dir;
            if dir.is_null() {
                return Err(KernelError::InvalidArgument {
                    what: "null DIR pointer",
                });
            }
            // SAFETY: user pointer, valid in the caller's space.
            fs::closedir(unsafe { &mut *dir }).map(|()| 0)
        }
        SyscallId::Unlink => {
            let mut buf = [0u8; 128];
            let path = user_cstr(frame.arg0 as *const u8, &mut buf)?;
            fs::unlink(path).map(|()| 0)
        }
    }
}

/// Longest user string the kernel will copy in one go.
const USER_STR_MAX: usize = 1024;

/// Bounded strlen over a user pointer in the current address space.
pub(crate) fn user_strlen(ptr: *const u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let mut len = 0;
    // SAFETY: reads through the caller's current mapping, bounded.
    while len < USER_STR_MAX && unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    len
}

/// Copy a NUL-terminated user string into `buf`, returning it as `&str`.
pub(crate) fn user_cstr<'a>(ptr: *const u8, buf: &'a mut [u8]) -> KernelResult<&'a str> {
    if ptr.is_null() {
        return Err(KernelError::InvalidArgument {
            what: "null string pointer",
        });
    }

    let mut len = 0;
    while len < buf.len() - 1 {
        // SAFETY: reads through the caller's current mapping, bounded by
        // the destination buffer.
        let byte = unsafe { *ptr.add(len) };
        if byte == 0 {
            break;
        }
        buf[len] = byte;
        len += 1;
    }

    core::str::from_utf8(&buf[..len]).map_err(|_| KernelError::InvalidArgument {
        what: "non-UTF-8 path",
    })
}

fn user_bytes<'a>(ptr: *const u8, len: usize) -> KernelResult<&'a [u8]> {
    if ptr.is_null() || len == 0 {
        return Err(KernelError::InvalidArgument {
            what: "empty user buffer",
        });
    }
    // SAFETY: user buffer in the caller's current mapping; the caller of
    // the syscall vouches for its length.
    Ok(unsafe { core::slice::from_raw_parts(ptr, len) })
}

fn user_bytes_mut<'a>(ptr: *mut u8, len: usize) -> KernelResult<&'a mut [u8]> {
    if ptr.is_null() || len == 0 {
        return Err(KernelError::InvalidArgument {
            what: "empty user buffer",
        });
    }
    // SAFETY: as user_bytes, writable per the syscall contract.
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr, len) })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn id_table_matches_the_documented_numbers() {
        assert_eq!(SyscallId::try_from(0), Ok(SyscallId::Msleep));
        assert_eq!(SyscallId::try_from(3), Ok(SyscallId::Fork));
        assert_eq!(SyscallId::try_from(7), Ok(SyscallId::Exit));
        assert_eq!(SyscallId::try_from(10), Ok(SyscallId::Open));
        assert_eq!(SyscallId::try_from(16), Ok(SyscallId::Sbrk));
        assert_eq!(SyscallId::try_from(23), Ok(SyscallId::Unlink));
        // Holes and out-of-range ids are rejected
        assert_eq!(SyscallId::try_from(8), Err(()));
        assert_eq!(SyscallId::try_from(9), Err(()));
        assert_eq!(SyscallId::try_from(24), Err(()));
        assert_eq!(SyscallId::try_from(1000), Err(()));
    }

    #[test]
    fn user_cstr_copies_and_bounds() {
        let src = b"hello\0world";
        let mut buf = [0u8; 16];
        let s = user_cstr(src.as_ptr(), &mut buf).unwrap();
        assert_eq!(s, "hello");

        // Truncation at the buffer edge
        let long = [b'a'; 64];
        let mut small = [0u8; 8];
        let s = user_cstr(long.as_ptr(), &mut small).unwrap();
        assert_eq!(s.len(), 7);
    }

    #[test]
    fn user_strlen_is_bounded_and_null_safe() {
        assert_eq!(user_strlen(core::ptr::null()), 0);
        let s = b"four\0";
        assert_eq!(user_strlen(s.as_ptr()), 4);
    }

    #[test]
    fn frame_layout_is_stable() {
        use core::mem::offset_of;
        // The assembly entry stub depends on these offsets.
        assert_eq!(offset_of!(SyscallFrame, eflags), 0);
        assert_eq!(offset_of!(SyscallFrame, eax), 12 * 4);
        assert_eq!(offset_of!(SyscallFrame, func_id), 15 * 4);
        assert_eq!(offset_of!(SyscallFrame, ss), 21 * 4);
        assert_eq!(core::mem::size_of::<SyscallFrame>(), 22 * 4);
    }
}
