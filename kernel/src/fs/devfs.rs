//! Device filesystem
//!
//! Maps `/dev/<name><minor>` paths onto the device registry through a
//! static name table. The minor number is the decimal suffix after the
//! name prefix; a bare name means minor 0, and a non-numeric suffix is
//! rejected rather than silently aliased to 0.

use crate::drivers::{self, DevMajor};
use crate::error::{KernelError, KernelResult};

use super::file::{File, FileType};
use super::{Dir, Dirent, FileSystem, Stat};

struct DevfsEntry {
    prefix: &'static str,
    major: DevMajor,
    ftype: FileType,
}

/// Supported device classes.
static DEVFS_TYPES: [DevfsEntry; 1] = [DevfsEntry {
    prefix: "tty",
    major: DevMajor::Tty,
    ftype: FileType::Tty,
}];

/// Decimal minor suffix: empty means 0, anything non-numeric is an error.
pub(crate) fn parse_minor(suffix: &str) -> KernelResult<u32> {
    if suffix.is_empty() {
        return Ok(0);
    }

    let mut minor = 0u32;
    for byte in suffix.bytes() {
        if !byte.is_ascii_digit() {
            return Err(KernelError::InvalidArgument {
                what: "device minor suffix",
            });
        }
        minor = minor * 10 + (byte - b'0') as u32;
    }
    Ok(minor)
}

/// The /dev filesystem. Stateless: every open goes straight to the device
/// registry.
pub struct DevFs;

impl DevFs {
    pub const fn new() -> Self {
        Self
    }
}

impl Default for DevFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for DevFs {
    fn open(&mut self, path: &str, file: &mut File) -> KernelResult<()> {
        for entry in &DEVFS_TYPES {
            let Some(suffix) = path.strip_prefix(entry.prefix) else {
                continue;
            };

            let minor = parse_minor(suffix)?;
            let dev_id = drivers::dev_open(entry.major, minor)?;

            file.dev_id = Some(dev_id);
            file.ftype = entry.ftype;
            file.pos = 0;
            file.size = 0;
            return Ok(());
        }

        Err(KernelError::NotFound)
    }

    fn read(&mut self, buf: &mut [u8], file: &mut File) -> KernelResult<usize> {
        let dev_id = file.dev_id.ok_or(KernelError::BadFileDescriptor)?;
        drivers::dev_read(dev_id, file.pos, buf)
    }

    fn write(&mut self, buf: &[u8], file: &mut File) -> KernelResult<usize> {
        let dev_id = file.dev_id.ok_or(KernelError::BadFileDescriptor)?;
        drivers::dev_write(dev_id, file.pos, buf)
    }

    fn seek(&mut self, _file: &mut File, _offset: u32, _whence: u32) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    fn stat(&mut self, _file: &File, _st: &mut Stat) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    fn close(&mut self, file: &mut File) -> KernelResult<()> {
        if let Some(dev_id) = file.dev_id.take() {
            drivers::dev_close(dev_id);
        }
        Ok(())
    }

    fn ioctl(&mut self, file: &mut File, cmd: i32, arg0: u32, arg1: u32) -> KernelResult<i32> {
        let dev_id = file.dev_id.ok_or(KernelError::BadFileDescriptor)?;
        drivers::dev_control(dev_id, cmd, arg0, arg1)
    }

    fn opendir(&mut self, _path: &str, _dir: &mut Dir) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    fn readdir(&mut self, _dir: &mut Dir, _out: &mut Dirent) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    fn closedir(&mut self, _dir: &mut Dir) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    fn unlink(&mut self, _path: &str) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::file::OpenFlags;
    use super::*;
    use crate::drivers::DevDriver;
    use crate::sched::testing::sched_test_guard;

    #[test]
    fn minor_suffix_parsing_is_pinned() {
        // Decision for the ambiguous cases: bare name is minor 0,
        // non-numeric garbage is rejected instead of aliasing to 0.
        assert_eq!(parse_minor("").unwrap(), 0);
        assert_eq!(parse_minor("0").unwrap(), 0);
        assert_eq!(parse_minor("3").unwrap(), 3);
        assert_eq!(parse_minor("12").unwrap(), 12);
        assert!(parse_minor("x").is_err());
        assert!(parse_minor("1x").is_err());
        assert!(parse_minor("-1").is_err());
    }

    struct NullTty;

    impl DevDriver for NullTty {
        fn open(&self, _minor: u32) -> KernelResult<()> {
            Ok(())
        }

        fn read(&self, _minor: u32, _addr: u32, buf: &mut [u8]) -> KernelResult<usize> {
            buf.fill(b't');
            Ok(buf.len())
        }

        fn write(&self, _minor: u32, _addr: u32, buf: &[u8]) -> KernelResult<usize> {
            Ok(buf.len())
        }

        fn control(&self, minor: u32, _cmd: i32, _arg0: u32, _arg1: u32) -> KernelResult<i32> {
            Ok(minor as i32)
        }

        fn close(&self, _minor: u32) {}
    }

    static NULL_TTY: NullTty = NullTty;

    #[test]
    fn open_routes_tty_paths_to_the_registry() {
        let _guard = sched_test_guard();
        crate::drivers::register_driver(DevMajor::Tty, &NULL_TTY);

        let mut fs = DevFs::new();
        let mut file = File::empty();
        file.mode = OpenFlags::RDWR;

        fs.open("tty2", &mut file).unwrap();
        assert_eq!(file.ftype, FileType::Tty);
        assert!(file.dev_id.is_some());

        let mut buf = [0u8; 3];
        assert_eq!(fs.read(&mut buf, &mut file).unwrap(), 3);
        assert_eq!(&buf, b"ttt");
        assert_eq!(fs.ioctl(&mut file, 0, 0, 0).unwrap(), 2);

        fs.close(&mut file).unwrap();
        assert!(file.dev_id.is_none());
    }

    #[test]
    fn open_rejects_unknown_names_and_bad_suffixes() {
        let _guard = sched_test_guard();
        crate::drivers::register_driver(DevMajor::Tty, &NULL_TTY);

        let mut fs = DevFs::new();
        let mut file = File::empty();

        assert!(matches!(
            fs.open("serial0", &mut file),
            Err(KernelError::NotFound)
        ));
        assert!(matches!(
            fs.open("ttyx", &mut file),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn seek_and_stat_are_unsupported() {
        let mut fs = DevFs::new();
        let mut file = File::empty();
        assert!(matches!(
            fs.seek(&mut file, 0, 0),
            Err(KernelError::NotSupported)
        ));
        let mut st = Stat::zeroed();
        assert!(matches!(
            fs.stat(&file, &mut st),
            Err(KernelError::NotSupported)
        ));
    }
}
