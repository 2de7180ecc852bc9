//! ATA PIO disk driver, primary channel
//!
//! Two drives at I/O base 0x1F0, probed with IDENTIFY (polled, because the
//! probe runs before interrupts are enabled), partitioned per the MBR.
//! Transfers are serialized by the channel mutex and paced sector by sector
//! with the channel semaphore, which the IDE interrupt posts exactly once
//! per sector. An ERR status ends a transfer early with the partial count.

// Port constants and the channel locks are only exercised on the real
// target; host builds still compile the pure parsing half.
#![allow(dead_code)]

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::sched::sync::{KMutex, KSemaphore};

use super::{DevDriver, DevMajor};

/// Sector size, bytes
pub const SECTOR_SIZE: usize = 512;

/// Drives on the primary channel
pub const DISK_COUNT: usize = 2;

/// Partition slots per disk: whole-disk entry plus four MBR primaries
pub const PART_COUNT: usize = 5;

/// Primary channel I/O port base
const IOBASE_PRIMARY: u16 = 0x1F0;

// Register offsets from the port base
const REG_DATA: u16 = 0;
const REG_SECTOR_COUNT: u16 = 2;
const REG_LBA_LO: u16 = 3;
const REG_LBA_MID: u16 = 4;
const REG_LBA_HI: u16 = 5;
const REG_DRIVE: u16 = 6;
const REG_STATUS: u16 = 7;
const REG_CMD: u16 = 7;

// Commands
const CMD_READ_EXT: u8 = 0x24;
const CMD_WRITE_EXT: u8 = 0x34;
const CMD_IDENTIFY: u8 = 0xEC;

// Status bits
const STATUS_ERR: u8 = 1 << 0;
const STATUS_DRQ: u8 = 1 << 3;
const STATUS_BUSY: u8 = 1 << 7;

/// Drive-select base: LBA mode, bit 4 = slave
const DRIVE_BASE: u8 = 0xE0;

/// MBR partition types this kernel recognizes as FAT16
pub const SYSTEM_ID_FAT16_CHS: u8 = 0x06;
pub const SYSTEM_ID_FAT16_LBA: u8 = 0x0E;

const MBR_PART_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_SIGNATURE_OFFSET: usize = 510;

/// One partition slot. Slot 0 covers the whole disk.
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    name: [u8; 8],
    name_len: usize,
    pub system_id: u8,
    pub start_lba: u32,
    pub total_sectors: u32,
}

impl Partition {
    const fn empty() -> Self {
        Self {
            name: [0; 8],
            name_len: 0,
            system_id: 0,
            start_lba: 0,
            total_sectors: 0,
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("?")
    }

    pub fn is_present(&self) -> bool {
        self.total_sectors != 0
    }

    pub fn is_fat16(&self) -> bool {
        matches!(self.system_id, SYSTEM_ID_FAT16_CHS | SYSTEM_ID_FAT16_LBA)
    }
}

/// One drive on the channel.
pub struct Disk {
    name: [u8; 4],
    drive_sel: u8,
    port_base: u16,
    pub sector_size: u32,
    pub sector_count: u32,
    pub present: bool,
    pub partitions: [Partition; PART_COUNT],
}

impl Disk {
    const fn empty() -> Self {
        Self {
            name: [0; 4],
            drive_sel: 0,
            port_base: IOBASE_PRIMARY,
            sector_size: 0,
            sector_count: 0,
            present: false,
            partitions: [Partition::empty(); PART_COUNT],
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..3]).unwrap_or("?")
    }
}

struct DisksCell(core::cell::UnsafeCell<[Disk; DISK_COUNT]>);

// SAFETY: written only during single-threaded init; read-only afterwards.
unsafe impl Sync for DisksCell {}

static DISKS: DisksCell = DisksCell(core::cell::UnsafeCell::new(
    [const { Disk::empty() }; DISK_COUNT],
));

/// Serializes every command on the channel. The semaphore below has no
/// owner binding, so this mutex is load-bearing for correctness: only one
/// transfer may be in flight.
static CHANNEL_MUTEX: KMutex = KMutex::new();

/// Posted once per completed sector by the IDE interrupt.
static OP_SEM: KSemaphore = KSemaphore::new(0);

/// A transfer is in flight; stray interrupts outside one are dropped.
static TASK_ON_OP: AtomicBool = AtomicBool::new(false);

/// Split a device minor into (disk index, partition index).
///
/// High nibble counts disks from 0xa (sda), low nibble is the partition.
pub fn minor_split(minor: u32) -> KernelResult<(usize, usize)> {
    let disk = ((minor >> 4) as usize).wrapping_sub(0xa);
    let part = (minor & 0xF) as usize;
    if disk >= DISK_COUNT || part >= PART_COUNT {
        return Err(KernelError::InvalidArgument {
            what: "disk device minor",
        });
    }
    Ok((disk, part))
}

/// Compose `sd<letter><index>`.
fn part_name(disk_index: usize, part_index: usize) -> ([u8; 8], usize) {
    let mut name = [0u8; 8];
    name[0] = b's';
    name[1] = b'd';
    name[2] = b'a' + disk_index as u8;
    name[3] = b'0' + part_index as u8;
    (name, 4)
}

/// A raw MBR primary-partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrEntry {
    pub system_id: u8,
    pub relative_sectors: u32,
    pub total_sectors: u32,
}

/// Parse the four primary entries out of an MBR sector.
pub fn parse_mbr(sector: &[u8]) -> KernelResult<[MbrEntry; 4]> {
    if sector.len() < SECTOR_SIZE {
        return Err(KernelError::Io);
    }
    if sector[MBR_SIGNATURE_OFFSET] != 0x55 || sector[MBR_SIGNATURE_OFFSET + 1] != 0xAA {
        return Err(KernelError::Io);
    }

    let mut entries = [MbrEntry {
        system_id: 0,
        relative_sectors: 0,
        total_sectors: 0,
    }; 4];

    for (i, entry) in entries.iter_mut().enumerate() {
        let base = MBR_PART_TABLE_OFFSET + i * MBR_ENTRY_SIZE;
        entry.system_id = sector[base + 4];
        entry.relative_sectors = u32::from_le_bytes([
            sector[base + 8],
            sector[base + 9],
            sector[base + 10],
            sector[base + 11],
        ]);
        entry.total_sectors = u32::from_le_bytes([
            sector[base + 12],
            sector[base + 13],
            sector[base + 14],
            sector[base + 15],
        ]);
    }

    Ok(entries)
}

/// Fill partition slots 1..=4 from parsed MBR entries.
fn apply_mbr(disk: &mut Disk, disk_index: usize, entries: &[MbrEntry; 4]) {
    for (i, entry) in entries.iter().enumerate() {
        let slot = &mut disk.partitions[i + 1];
        slot.system_id = entry.system_id;

        if entry.system_id == 0 {
            *slot = Partition::empty();
            continue;
        }

        let (name, len) = part_name(disk_index, i + 1);
        slot.name = name;
        slot.name_len = len;
        slot.start_lba = entry.relative_sectors;
        slot.total_sectors = entry.total_sectors;
    }
}

/// Sector count out of an IDENTIFY response (words 100..102).
fn identify_sector_count(words: &[u16; 256]) -> u32 {
    (words[100] as u32) | ((words[101] as u32) << 16)
}

/// Shared read-only view of the probed disks.
fn disks() -> &'static [Disk; DISK_COUNT] {
    // SAFETY: mutated only during init, before any other task runs.
    unsafe { &*DISKS.0.get() }
}

fn partition_of(minor: u32) -> KernelResult<(&'static Disk, &'static Partition)> {
    let (disk_index, part_index) = minor_split(minor)?;
    let disk = &disks()[disk_index];
    if !disk.present {
        return Err(KernelError::NotFound);
    }
    let part = &disk.partitions[part_index];
    if !part.is_present() {
        return Err(KernelError::NotFound);
    }
    Ok((disk, part))
}

/// IDE primary-channel interrupt body. The platform glue acknowledges the
/// PIC and calls this; all we do is post the per-sector completion.
pub fn irq_handler() {
    if TASK_ON_OP.load(Ordering::Relaxed) && crate::sched::current().is_some() {
        OP_SEM.notify();
    }
}

/// Registry vtable for the channel's disks.
pub struct AtaDriver;

pub static ATA_DRIVER: AtaDriver = AtaDriver;

#[cfg(target_arch = "x86")]
mod pio {
    use super::*;
    use crate::arch::x86::{inb, inw, outb, outw};

    /// Issue a 48-bit LBA command: high-order bytes first, then low, then
    /// the drive selection already latched via REG_DRIVE.
    fn send_cmd(disk: &Disk, start_lba: u32, sector_count: u32, cmd: u8) {
        let base = disk.port_base;
        // SAFETY: the channel mutex serializes port access to this channel.
        unsafe {
            outb(base + REG_DRIVE, DRIVE_BASE | disk.drive_sel);

            outb(base + REG_SECTOR_COUNT, (sector_count >> 8) as u8);
            outb(base + REG_LBA_LO, (start_lba >> 24) as u8);
            outb(base + REG_LBA_MID, 0);
            outb(base + REG_LBA_HI, 0);

            outb(base + REG_SECTOR_COUNT, sector_count as u8);
            outb(base + REG_LBA_LO, start_lba as u8);
            outb(base + REG_LBA_MID, (start_lba >> 8) as u8);
            outb(base + REG_LBA_HI, (start_lba >> 16) as u8);

            outb(base + REG_CMD, cmd);
        }
    }

    /// Poll until BUSY clears with DRQ or ERR raised.
    fn wait_data(disk: &Disk) -> KernelResult<()> {
        let status = loop {
            // SAFETY: status read has no side effect beyond the device's
            // interrupt latch, which the IRQ handler tolerates.
            let status = unsafe { inb(disk.port_base + REG_STATUS) };
            if (status & (STATUS_BUSY | STATUS_DRQ | STATUS_ERR)) != STATUS_BUSY {
                break status;
            }
        };

        if status & STATUS_ERR != 0 {
            Err(KernelError::Io)
        } else {
            Ok(())
        }
    }

    fn read_data(disk: &Disk, buf: &mut [u8]) {
        for chunk in buf.chunks_exact_mut(2) {
            // SAFETY: DRQ is set (wait_data) and the channel is ours.
            let word = unsafe { inw(disk.port_base + REG_DATA) };
            chunk[0] = word as u8;
            chunk[1] = (word >> 8) as u8;
        }
    }

    fn write_data(disk: &Disk, buf: &[u8]) {
        for chunk in buf.chunks_exact(2) {
            let word = (chunk[0] as u16) | ((chunk[1] as u16) << 8);
            // SAFETY: the device expects data words after a write command.
            unsafe { outw(disk.port_base + REG_DATA, word) };
        }
    }

    /// Probe one drive: IDENTIFY (polled; interrupts are still off during
    /// init), then the MBR.
    fn identify(disk: &mut Disk, disk_index: usize) -> KernelResult<()> {
        send_cmd(disk, 0, 0, CMD_IDENTIFY);

        // A zero status means no controller behind this select
        // SAFETY: status read on the probed channel.
        if unsafe { inb(disk.port_base + REG_STATUS) } == 0 {
            return Err(KernelError::NotFound);
        }

        wait_data(disk)?;
        let mut words = [0u16; 256];
        for word in words.iter_mut() {
            // SAFETY: IDENTIFY data is ready (wait_data).
            *word = unsafe { inw(disk.port_base + REG_DATA) };
        }

        disk.sector_count = identify_sector_count(&words);
        disk.sector_size = SECTOR_SIZE as u32;

        // Slot 0 describes the whole disk
        let (name, len) = part_name(disk_index, 0);
        disk.partitions[0] = Partition {
            name,
            name_len: len,
            system_id: 0,
            start_lba: 0,
            total_sectors: disk.sector_count,
        };

        // Read LBA 0 and pick up the primary partitions
        let mut mbr = [0u8; SECTOR_SIZE];
        send_cmd(disk, 0, 1, CMD_READ_EXT);
        wait_data(disk)?;
        read_data(disk, &mut mbr);

        let entries = parse_mbr(&mbr)?;
        apply_mbr(disk, disk_index, &entries);
        Ok(())
    }

    /// Probe the channel. Runs once at boot, interrupts disabled.
    pub fn init() {
        log::info!("checking disks");

        // SAFETY: single-threaded init; sole mutation of the disk table.
        let all = unsafe { &mut *DISKS.0.get() };
        for (i, disk) in all.iter_mut().enumerate() {
            *disk = Disk::empty();
            disk.name[..2].copy_from_slice(b"sd");
            disk.name[2] = b'a' + i as u8;
            disk.drive_sel = (i as u8) << 4;
            disk.port_base = IOBASE_PRIMARY;

            if identify(disk, i).is_ok() {
                disk.present = true;
                log_disk(disk);
            }
        }
    }

    fn log_disk(disk: &Disk) {
        log::info!(
            "{}: {} MiB ({} sectors), {}",
            disk.name(),
            disk.sector_count as u64 * disk.sector_size as u64 / 1024 / 1024,
            disk.sector_count,
            if disk.drive_sel == 0 { "master" } else { "slave" },
        );
        for part in &disk.partitions {
            if part.is_present() {
                log::info!(
                    "  {}: type {:#04x}, start {}, sectors {}",
                    part.name(),
                    part.system_id,
                    part.start_lba,
                    part.total_sectors,
                );
            }
        }
    }

    /// Transfer sectors; returns the number completed (partial on ERR).
    pub fn transfer(
        minor: u32,
        lba: u32,
        buf_read: Option<&mut [u8]>,
        buf_write: Option<&[u8]>,
    ) -> KernelResult<usize> {
        let (disk, part) = partition_of(minor)?;
        let count = match (&buf_read, &buf_write) {
            (Some(buf), None) => buf.len() / SECTOR_SIZE,
            (None, Some(buf)) => buf.len() / SECTOR_SIZE,
            _ => 0,
        };
        if count == 0 {
            return Ok(0);
        }

        CHANNEL_MUTEX.lock();
        TASK_ON_OP.store(true, Ordering::Relaxed);

        let start = part.start_lba + lba;
        let cmd = if buf_read.is_some() {
            CMD_READ_EXT
        } else {
            CMD_WRITE_EXT
        };
        send_cmd(disk, start, count as u32, cmd);

        let mut done = 0;
        let mut read_buf = buf_read;
        let mut write_buf = buf_write;
        while done < count {
            let range = done * SECTOR_SIZE..(done + 1) * SECTOR_SIZE;

            if let Some(buf) = write_buf.as_mut() {
                // Data goes out first, the completion interrupt follows
                write_data(disk, &buf[range.clone()]);
            }

            // One semaphore post per sector from the IRQ handler; before
            // the scheduler runs, the poll below is the only pacing.
            if crate::sched::current().is_some() {
                OP_SEM.wait();
            }

            if wait_data(disk).is_err() {
                log::warn!(
                    "{}: {} error at sector {} of {}",
                    disk.name(),
                    if write_buf.is_some() { "write" } else { "read" },
                    start + done as u32,
                    count,
                );
                break;
            }

            if let Some(buf) = read_buf.as_mut() {
                read_data(disk, &mut buf[range]);
            }

            done += 1;
        }

        TASK_ON_OP.store(false, Ordering::Relaxed);
        CHANNEL_MUTEX.unlock();
        Ok(done)
    }
}

/// Probe the channel at boot. Present only on the real target.
#[cfg(target_arch = "x86")]
pub fn init() {
    pio::init();
}

impl DevDriver for AtaDriver {
    fn open(&self, minor: u32) -> KernelResult<()> {
        partition_of(minor).map(|_| ())
    }

    #[cfg(target_arch = "x86")]
    fn read(&self, minor: u32, lba: u32, buf: &mut [u8]) -> KernelResult<usize> {
        pio::transfer(minor, lba, Some(buf), None)
    }

    #[cfg(not(target_arch = "x86"))]
    fn read(&self, _minor: u32, _lba: u32, _buf: &mut [u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    #[cfg(target_arch = "x86")]
    fn write(&self, minor: u32, lba: u32, buf: &[u8]) -> KernelResult<usize> {
        pio::transfer(minor, lba, None, Some(buf))
    }

    #[cfg(not(target_arch = "x86"))]
    fn write(&self, _minor: u32, _lba: u32, _buf: &[u8]) -> KernelResult<usize> {
        Err(KernelError::NotSupported)
    }

    fn control(&self, _minor: u32, _cmd: i32, _arg0: u32, _arg1: u32) -> KernelResult<i32> {
        Ok(0)
    }

    fn close(&self, _minor: u32) {}

    fn sector_count(&self, minor: u32) -> KernelResult<u32> {
        let (_, part) = partition_of(minor)?;
        Ok(part.total_sectors)
    }
}

/// Register the channel driver with the device registry.
pub fn register() {
    super::register_driver(DevMajor::Disk, &ATA_DRIVER);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn mbr_sector(entries: &[(u8, u32, u32)]) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        for (i, &(system_id, start, total)) in entries.iter().enumerate() {
            let base = MBR_PART_TABLE_OFFSET + i * MBR_ENTRY_SIZE;
            sector[base + 4] = system_id;
            sector[base + 8..base + 12].copy_from_slice(&start.to_le_bytes());
            sector[base + 12..base + 16].copy_from_slice(&total.to_le_bytes());
        }
        sector[MBR_SIGNATURE_OFFSET] = 0x55;
        sector[MBR_SIGNATURE_OFFSET + 1] = 0xAA;
        sector
    }

    #[test]
    fn parse_mbr_reads_little_endian_fields() {
        let sector = mbr_sector(&[(SYSTEM_ID_FAT16_LBA, 2048, 100_000), (0x83, 102_448, 50_000)]);
        let entries = parse_mbr(&sector).unwrap();

        assert_eq!(
            entries[0],
            MbrEntry {
                system_id: SYSTEM_ID_FAT16_LBA,
                relative_sectors: 2048,
                total_sectors: 100_000,
            }
        );
        assert_eq!(entries[1].system_id, 0x83);
        assert_eq!(entries[2].system_id, 0);
    }

    #[test]
    fn parse_mbr_requires_signature() {
        let mut sector = mbr_sector(&[]);
        sector[MBR_SIGNATURE_OFFSET] = 0;
        assert!(parse_mbr(&sector).is_err());
    }

    #[test]
    fn apply_mbr_names_partitions() {
        let sector = mbr_sector(&[(SYSTEM_ID_FAT16_CHS, 63, 4000)]);
        let entries = parse_mbr(&sector).unwrap();

        let mut disk = Disk::empty();
        apply_mbr(&mut disk, 0, &entries);

        let part = &disk.partitions[1];
        assert!(part.is_present());
        assert!(part.is_fat16());
        assert_eq!(part.name(), "sda1");
        assert_eq!(part.start_lba, 63);

        assert!(!disk.partitions[2].is_present());
    }

    #[test]
    fn minor_encoding_splits_disk_and_partition() {
        assert_eq!(minor_split(0xa0).unwrap(), (0, 0));
        assert_eq!(minor_split(0xb1).unwrap(), (1, 1));
        assert_eq!(minor_split(0xa4).unwrap(), (0, 4));
        assert!(minor_split(0xc0).is_err(), "no third disk");
        assert!(minor_split(0xa5).is_err(), "no sixth partition");
        assert!(minor_split(0x90).is_err(), "below the sda base");
    }

    #[test]
    fn identify_words_yield_sector_count() {
        let mut words = [0u16; 256];
        words[100] = 0x9000;
        words[101] = 0x0001;
        assert_eq!(identify_sector_count(&words), 0x19000);
    }
}
