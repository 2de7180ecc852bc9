//! Device drivers and the device registry
//!
//! Character and block drivers register a vtable per major number; open
//! instances are tracked with open counts so a device minor opened twice
//! (e.g. the same tty by two tasks) closes only on the last release. The
//! console/keyboard tty driver lives outside the kernel core and registers
//! itself at boot through [`register_driver`].

pub mod ata;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Major device numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevMajor {
    Tty = 1,
    Disk = 2,
}

/// Driver vtable.
///
/// `addr` is a byte position for character devices and a sector LBA for
/// block devices; block transfers are sized by the buffer (whole sectors)
/// and report the number of units actually moved.
pub trait DevDriver: Send + Sync {
    fn open(&self, minor: u32) -> KernelResult<()>;
    fn read(&self, minor: u32, addr: u32, buf: &mut [u8]) -> KernelResult<usize>;
    fn write(&self, minor: u32, addr: u32, buf: &[u8]) -> KernelResult<usize>;
    fn control(&self, minor: u32, cmd: i32, arg0: u32, arg1: u32) -> KernelResult<i32>;
    fn close(&self, minor: u32);

    /// Capacity in sectors, block devices only.
    fn sector_count(&self, _minor: u32) -> KernelResult<u32> {
        Err(KernelError::NotSupported)
    }
}

const MAJOR_MAX: usize = 8;

/// Concurrently open device instances, system wide
const OPEN_DEV_MAX: usize = 32;

#[derive(Clone, Copy)]
struct OpenDevice {
    major: DevMajor,
    minor: u32,
    open_count: u32,
}

static DRIVERS: Mutex<[Option<&'static dyn DevDriver>; MAJOR_MAX]> = Mutex::new([None; MAJOR_MAX]);

static OPEN_DEVICES: Mutex<[Option<OpenDevice>; OPEN_DEV_MAX]> = Mutex::new([None; OPEN_DEV_MAX]);

/// Install the vtable for a major number. Later registrations win, which
/// lets tests install mocks.
pub fn register_driver(major: DevMajor, driver: &'static dyn DevDriver) {
    DRIVERS.lock()[major as usize] = Some(driver);
}

fn driver_for(major: DevMajor) -> KernelResult<&'static dyn DevDriver> {
    DRIVERS.lock()[major as usize].ok_or(KernelError::NotFound)
}

/// Open (or re-open) a device instance; returns its registry id.
pub fn dev_open(major: DevMajor, minor: u32) -> KernelResult<usize> {
    let driver = driver_for(major)?;

    {
        let mut open = OPEN_DEVICES.lock();
        for (i, slot) in open.iter_mut().enumerate() {
            if let Some(dev) = slot {
                if dev.major == major && dev.minor == minor {
                    dev.open_count += 1;
                    return Ok(i);
                }
            }
        }
    }

    // First open goes through the driver before the slot is published
    driver.open(minor)?;

    let mut open = OPEN_DEVICES.lock();
    for (i, slot) in open.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(OpenDevice {
                major,
                minor,
                open_count: 1,
            });
            return Ok(i);
        }
    }

    driver.close(minor);
    Err(KernelError::TableFull {
        table: "open device",
    })
}

fn instance(dev_id: usize) -> KernelResult<OpenDevice> {
    OPEN_DEVICES
        .lock()
        .get(dev_id)
        .copied()
        .flatten()
        .ok_or(KernelError::BadFileDescriptor)
}

/// Read from an open device. Blocks in the driver, never under a lock.
pub fn dev_read(dev_id: usize, addr: u32, buf: &mut [u8]) -> KernelResult<usize> {
    let dev = instance(dev_id)?;
    driver_for(dev.major)?.read(dev.minor, addr, buf)
}

/// Write to an open device.
pub fn dev_write(dev_id: usize, addr: u32, buf: &[u8]) -> KernelResult<usize> {
    let dev = instance(dev_id)?;
    driver_for(dev.major)?.write(dev.minor, addr, buf)
}

/// Device-specific control call.
pub fn dev_control(dev_id: usize, cmd: i32, arg0: u32, arg1: u32) -> KernelResult<i32> {
    let dev = instance(dev_id)?;
    driver_for(dev.major)?.control(dev.minor, cmd, arg0, arg1)
}

/// Capacity of an open block device, in sectors.
pub fn dev_sector_count(dev_id: usize) -> KernelResult<u32> {
    let dev = instance(dev_id)?;
    driver_for(dev.major)?.sector_count(dev.minor)
}

/// Drop one open reference; the driver's close runs on the last one.
pub fn dev_close(dev_id: usize) {
    let mut open = OPEN_DEVICES.lock();
    let Some(Some(dev)) = open.get_mut(dev_id) else {
        return;
    };

    dev.open_count -= 1;
    if dev.open_count > 0 {
        return;
    }

    let (major, minor) = (dev.major, dev.minor);
    open[dev_id] = None;
    drop(open);

    if let Ok(driver) = driver_for(major) {
        driver.close(minor);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::sched::testing::sched_test_guard;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct MockTty {
        opens: AtomicU32,
        closes: AtomicU32,
    }

    impl DevDriver for MockTty {
        fn open(&self, _minor: u32) -> KernelResult<()> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn read(&self, minor: u32, _addr: u32, buf: &mut [u8]) -> KernelResult<usize> {
            buf.fill(minor as u8);
            Ok(buf.len())
        }

        fn write(&self, _minor: u32, _addr: u32, buf: &[u8]) -> KernelResult<usize> {
            Ok(buf.len())
        }

        fn control(&self, _minor: u32, cmd: i32, _arg0: u32, _arg1: u32) -> KernelResult<i32> {
            Ok(cmd)
        }

        fn close(&self, _minor: u32) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    static MOCK: MockTty = MockTty {
        opens: AtomicU32::new(0),
        closes: AtomicU32::new(0),
    };

    #[test]
    fn open_counts_share_one_driver_open() {
        let _guard = sched_test_guard();
        register_driver(DevMajor::Tty, &MOCK);
        let opens_before = MOCK.opens.load(Ordering::Relaxed);

        let a = dev_open(DevMajor::Tty, 11).unwrap();
        let b = dev_open(DevMajor::Tty, 11).unwrap();
        assert_eq!(a, b, "same minor shares the instance");
        assert_eq!(MOCK.opens.load(Ordering::Relaxed), opens_before + 1);

        let closes_before = MOCK.closes.load(Ordering::Relaxed);
        dev_close(a);
        assert_eq!(
            MOCK.closes.load(Ordering::Relaxed),
            closes_before,
            "driver close deferred to last reference"
        );
        dev_close(b);
        assert_eq!(MOCK.closes.load(Ordering::Relaxed), closes_before + 1);
    }

    #[test]
    fn io_routes_minor_to_driver() {
        let _guard = sched_test_guard();
        register_driver(DevMajor::Tty, &MOCK);

        let id = dev_open(DevMajor::Tty, 7).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(dev_read(id, 0, &mut buf).unwrap(), 4);
        assert_eq!(buf, [7u8; 4]);
        assert_eq!(dev_control(id, 42, 0, 0).unwrap(), 42);
        dev_close(id);
    }

    #[test]
    fn stale_ids_are_rejected() {
        let _guard = sched_test_guard();
        let mut buf = [0u8; 1];
        assert!(matches!(
            dev_read(OPEN_DEV_MAX + 1, 0, &mut buf),
            Err(KernelError::BadFileDescriptor)
        ));
    }
}
