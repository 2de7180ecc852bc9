//! FAT16 filesystem driver
//!
//! Flat 8.3 namespace over the root directory of a FAT16 partition. All
//! metadata I/O goes through a one-sector cache keyed by sector number;
//! whole-cluster data transfers bypass it. Every FAT edit is mirrored into
//! all FAT copies so the redundancy stays byte-identical.

use crate::error::{KernelError, KernelResult};

use super::blockdev::{BlockDevice, SECTOR_SIZE};
use super::file::{File, FileType, OpenFlags};
use super::{Dir, Dirent, Stat};

/// Cluster-link values: 0 is free, anything from END_MIN up terminates a
/// chain; a data cluster is in `2..END_MIN`.
const CLUSTER_FREE: u16 = 0x0000;
const CLUSTER_END_MIN: u16 = 0xFFF8;

/// Written as the "no cluster yet" marker and as the chain terminator.
const CLUSTER_INVALID: u16 = 0xFFF8;

/// 8.3 name length
const SFN_LEN: usize = 11;

/// Directory entry size on disk
const DIR_ENTRY_SIZE: usize = 32;

const DIRENT_NAME_END: u8 = 0x00;
const DIRENT_NAME_FREE: u8 = 0xE5;

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;

/// Largest supported cluster; the driver buffers one cluster at a time.
const CLUSTER_BUF_MAX: usize = 4096;

fn cluster_is_valid(cluster: u16) -> bool {
    (2..CLUSTER_END_MIN).contains(&cluster)
}

/// FAT16 instance over a block device.
pub struct Fat16Fs<B> {
    dev: B,

    bytes_per_sector: u32,
    sectors_per_cluster: u32,
    cluster_bytes: u32,
    fat_start: u32,
    fat_sectors: u32,
    fat_count: u32,
    root_start: u32,
    root_entries: u32,
    data_start: u32,

    buffer: [u8; CLUSTER_BUF_MAX],
    cached_sector: Option<u32>,
}

impl<B: BlockDevice> Fat16Fs<B> {
    /// Read and validate the DBR, extract the geometry.
    pub fn mount(mut dev: B) -> KernelResult<Self> {
        let mut dbr = [0u8; SECTOR_SIZE];
        if dev.read_sectors(0, &mut dbr)? != 1 {
            return Err(KernelError::Io);
        }

        let bytes_per_sector = u16::from_le_bytes([dbr[11], dbr[12]]) as u32;
        let sectors_per_cluster = dbr[13] as u32;
        let fat_start = u16::from_le_bytes([dbr[14], dbr[15]]) as u32;
        let fat_count = dbr[16] as u32;
        let root_entries = u16::from_le_bytes([dbr[17], dbr[18]]) as u32;
        let fat_sectors = u16::from_le_bytes([dbr[22], dbr[23]]) as u32;

        if &dbr[54..59] != b"FAT16" {
            log::warn!("mount: filesystem type is not FAT16");
            return Err(KernelError::NotSupported);
        }
        if fat_count != 2 {
            log::warn!("mount: unsupported FAT copy count {}", fat_count);
            return Err(KernelError::NotSupported);
        }
        if bytes_per_sector != SECTOR_SIZE as u32 {
            return Err(KernelError::NotSupported);
        }

        let cluster_bytes = sectors_per_cluster * bytes_per_sector;
        if cluster_bytes == 0 || cluster_bytes as usize > CLUSTER_BUF_MAX {
            return Err(KernelError::NotSupported);
        }

        let root_start = fat_start + fat_sectors * fat_count;
        let data_start = root_start + root_entries * DIR_ENTRY_SIZE as u32 / bytes_per_sector;

        Ok(Self {
            dev,
            bytes_per_sector,
            sectors_per_cluster,
            cluster_bytes,
            fat_start,
            fat_sectors,
            fat_count,
            root_start,
            root_entries,
            data_start,
            buffer: [0; CLUSTER_BUF_MAX],
            cached_sector: None,
        })
    }

    pub fn cluster_bytes(&self) -> u32 {
        self.cluster_bytes
    }

    /// First sector of a data cluster.
    fn cluster_sector(&self, cluster: u16) -> u32 {
        self.data_start + (cluster as u32 - 2) * self.sectors_per_cluster
    }

    /// Load `sector` into the cache unless it is already there.
    fn bread(&mut self, sector: u32) -> KernelResult<()> {
        if self.cached_sector == Some(sector) {
            return Ok(());
        }
        if self.dev.read_sectors(sector, &mut self.buffer[..SECTOR_SIZE])? != 1 {
            return Err(KernelError::Io);
        }
        self.cached_sector = Some(sector);
        Ok(())
    }

    /// Write the cached sector content to `sector`.
    fn bwrite(&mut self, sector: u32) -> KernelResult<()> {
        if self.dev.write_sectors(sector, &self.buffer[..SECTOR_SIZE])? != 1 {
            return Err(KernelError::Io);
        }
        Ok(())
    }

    /// Follow one FAT link.
    fn next_cluster(&mut self, cluster: u16) -> KernelResult<u16> {
        if !cluster_is_valid(cluster) {
            return Ok(CLUSTER_INVALID);
        }

        let offset = cluster as u32 * 2;
        let sector = offset / self.bytes_per_sector;
        let in_sector = (offset % self.bytes_per_sector) as usize;
        if sector >= self.fat_sectors {
            return Err(KernelError::Io);
        }

        self.bread(self.fat_start + sector)?;
        Ok(u16::from_le_bytes([
            self.buffer[in_sector],
            self.buffer[in_sector + 1],
        ]))
    }

    /// Rewrite one FAT link, mirrored into every FAT copy.
    fn set_next(&mut self, cluster: u16, next: u16) -> KernelResult<()> {
        if !cluster_is_valid(cluster) {
            return Err(KernelError::InvalidArgument {
                what: "FAT link outside the data range",
            });
        }

        let offset = cluster as u32 * 2;
        let sector = offset / self.bytes_per_sector;
        let in_sector = (offset % self.bytes_per_sector) as usize;
        if sector >= self.fat_sectors {
            return Err(KernelError::Io);
        }

        self.bread(self.fat_start + sector)?;
        self.buffer[in_sector..in_sector + 2].copy_from_slice(&next.to_le_bytes());

        for copy in 0..self.fat_count {
            self.bwrite(self.fat_start + copy * self.fat_sectors + sector)?;
        }
        Ok(())
    }

    /// Return a whole chain to the free pool.
    fn free_chain(&mut self, start: u16) -> KernelResult<()> {
        let mut cluster = start;
        while cluster_is_valid(cluster) {
            let next = self.next_cluster(cluster)?;
            self.set_next(cluster, CLUSTER_FREE)?;
            cluster = next;
        }
        Ok(())
    }

    /// Allocate a linked chain of `count` free clusters, scanning upward
    /// from cluster 2. A mid-scan failure frees what was claimed.
    fn alloc_chain(&mut self, count: u32) -> KernelResult<u16> {
        if count == 0 {
            return Err(KernelError::InvalidArgument {
                what: "empty cluster chain",
            });
        }

        let total = self.fat_sectors * self.bytes_per_sector / 2;
        let mut remaining = count;
        let mut start = CLUSTER_INVALID;
        let mut prev = CLUSTER_INVALID;

        let mut cluster = 2u32;
        while cluster < total && remaining > 0 {
            let candidate = cluster as u16;
            if !cluster_is_valid(candidate) {
                break;
            }
            if self.next_cluster(candidate)? == CLUSTER_FREE {
                if !cluster_is_valid(start) {
                    start = candidate;
                }
                if cluster_is_valid(prev) {
                    if let Err(e) = self.set_next(prev, candidate) {
                        let _ = self.free_chain(start);
                        return Err(e);
                    }
                }
                prev = candidate;
                remaining -= 1;
            }
            cluster += 1;
        }

        if remaining == 0 && self.set_next(prev, CLUSTER_INVALID).is_ok() {
            return Ok(start);
        }

        let _ = self.free_chain(start);
        Err(KernelError::NoSpace)
    }

    /// Read one root-directory entry.
    fn read_dir_entry(&mut self, index: u32) -> KernelResult<[u8; DIR_ENTRY_SIZE]> {
        if index >= self.root_entries {
            return Err(KernelError::InvalidArgument {
                what: "directory index",
            });
        }

        let offset = index * DIR_ENTRY_SIZE as u32;
        self.bread(self.root_start + offset / self.bytes_per_sector)?;

        let in_sector = (offset % self.bytes_per_sector) as usize;
        let mut entry = [0u8; DIR_ENTRY_SIZE];
        entry.copy_from_slice(&self.buffer[in_sector..in_sector + DIR_ENTRY_SIZE]);
        Ok(entry)
    }

    /// Write one root-directory entry back.
    fn write_dir_entry(&mut self, entry: &[u8; DIR_ENTRY_SIZE], index: u32) -> KernelResult<()> {
        if index >= self.root_entries {
            return Err(KernelError::InvalidArgument {
                what: "directory index",
            });
        }

        let offset = index * DIR_ENTRY_SIZE as u32;
        let sector = self.root_start + offset / self.bytes_per_sector;
        self.bread(sector)?;

        let in_sector = (offset % self.bytes_per_sector) as usize;
        self.buffer[in_sector..in_sector + DIR_ENTRY_SIZE].copy_from_slice(entry);
        self.bwrite(sector)
    }

    /// Populate a file record from a directory entry.
    fn file_from_entry(&self, file: &mut File, entry: &[u8; DIR_ENTRY_SIZE], index: u32) {
        file.ftype = entry_type(entry[11]);
        file.size = u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]);
        file.pos = 0;
        let hi = u16::from_le_bytes([entry[20], entry[21]]) as u32;
        let lo = u16::from_le_bytes([entry[26], entry[27]]) as u32;
        file.start_cluster = ((hi << 16) | lo) as u16;
        file.cur_cluster = file.start_cluster;
        file.dir_index = index;
    }

    /// Grow the cluster chain so `extra` more bytes fit past end-of-file.
    ///
    /// When the tail cluster still has room for all of them, nothing is
    /// allocated.
    fn expand_file(&mut self, file: &mut File, extra: u32) -> KernelResult<()> {
        let cb = self.cluster_bytes;
        let tail_used = file.size % cb;

        let cluster_count = if file.size == 0 || tail_used == 0 {
            extra.div_ceil(cb)
        } else {
            let tail_free = cb - tail_used;
            if tail_free >= extra {
                return Ok(());
            }
            (extra - tail_free).div_ceil(cb)
        };

        let start = self.alloc_chain(cluster_count)?;

        if !cluster_is_valid(file.start_cluster) {
            file.start_cluster = start;
            file.cur_cluster = start;
        } else {
            // Link at the chain tail; the current cluster may sit mid-chain
            // when the position was rewound before a growing write.
            let mut tail = if cluster_is_valid(file.cur_cluster) {
                file.cur_cluster
            } else {
                file.start_cluster
            };
            loop {
                let next = self.next_cluster(tail)?;
                if !cluster_is_valid(next) {
                    break;
                }
                tail = next;
            }
            self.set_next(tail, start)?;
        }
        Ok(())
    }

    /// Advance the position, following (and optionally growing) the chain
    /// across cluster boundaries.
    fn move_file_pos(&mut self, file: &mut File, bytes: u32, expand: bool) -> KernelResult<()> {
        let offset = file.pos % self.cluster_bytes;

        if offset + bytes >= self.cluster_bytes {
            let mut next = self.next_cluster(file.cur_cluster)?;
            if !cluster_is_valid(next) && expand {
                self.expand_file(file, self.cluster_bytes)?;
                next = self.next_cluster(file.cur_cluster)?;
            }
            file.cur_cluster = next;
        }

        file.pos += bytes;
        Ok(())
    }
}

/// File type encoded in the attribute byte; long-name, volume-id, hidden
/// and system entries are invisible.
fn entry_type(attr: u8) -> FileType {
    if attr & (ATTR_VOLUME_ID | ATTR_HIDDEN | ATTR_SYSTEM) != 0 {
        return FileType::Unknown;
    }
    if attr & ATTR_DIRECTORY != 0 {
        FileType::Directory
    } else {
        FileType::Regular
    }
}

/// Normalize a name to the padded upper-case 8.3 form.
fn to_sfn(name: &str) -> [u8; SFN_LEN] {
    let mut out = [b' '; SFN_LEN];
    let mut at = 0;

    for &byte in name.as_bytes() {
        if at >= SFN_LEN {
            break;
        }
        if byte == b'.' {
            at = 8;
        } else {
            out[at] = byte.to_ascii_uppercase();
            at += 1;
        }
    }
    out
}

fn sfn_matches(entry: &[u8; DIR_ENTRY_SIZE], name: &str) -> bool {
    entry[..SFN_LEN] == to_sfn(name)
}

/// De-pad an 8.3 name, inserting the dot; returns the length. A name with
/// no extension gets no dot.
fn sfn_display(sfn: &[u8], out: &mut [u8; SFN_LEN + 2]) -> usize {
    *out = [0; SFN_LEN + 2];
    let mut len = 0;
    let mut dot = None;

    for (i, &byte) in sfn.iter().take(SFN_LEN).enumerate() {
        if byte != b' ' {
            out[len] = byte;
            len += 1;
        }
        if i == 7 {
            dot = Some(len);
            out[len] = b'.';
            len += 1;
        }
    }

    if let Some(dot) = dot {
        if dot + 1 == len {
            out[dot] = 0;
            len = dot;
        }
    }
    len
}

/// A blank directory entry for a new file: normalized name, no clusters,
/// zero size, zeroed time and date fields.
fn new_dir_entry(name: &str, attr: u8) -> [u8; DIR_ENTRY_SIZE] {
    let mut entry = [0u8; DIR_ENTRY_SIZE];
    entry[..SFN_LEN].copy_from_slice(&to_sfn(name));
    entry[11] = attr;
    entry[20..22].copy_from_slice(&((CLUSTER_INVALID as u32 >> 16) as u16).to_le_bytes());
    entry[26..28].copy_from_slice(&CLUSTER_INVALID.to_le_bytes());
    // size (28..32) and every time/date field stay zero
    entry
}

impl<B: BlockDevice> super::FileSystem for Fat16Fs<B> {
    fn open(&mut self, path: &str, file: &mut File) -> KernelResult<()> {
        let mut found: Option<(u32, [u8; DIR_ENTRY_SIZE])> = None;
        let mut free_slot: Option<u32> = None;

        for index in 0..self.root_entries {
            let entry = self.read_dir_entry(index)?;
            match entry[0] {
                DIRENT_NAME_END => {
                    // Terminator: scan over, slot creatable
                    if free_slot.is_none() {
                        free_slot = Some(index);
                    }
                    break;
                }
                DIRENT_NAME_FREE => {
                    if free_slot.is_none() {
                        free_slot = Some(index);
                    }
                }
                _ => {
                    if sfn_matches(&entry, path) {
                        found = Some((index, entry));
                        break;
                    }
                }
            }
        }

        if let Some((index, entry)) = found {
            self.file_from_entry(file, &entry, index);

            if file.mode.contains(OpenFlags::TRUNC) && file.mode.writable() {
                self.free_chain(file.start_cluster)?;
                file.start_cluster = CLUSTER_INVALID;
                file.cur_cluster = CLUSTER_INVALID;
                file.size = 0;
            }
            return Ok(());
        }

        if file.mode.contains(OpenFlags::CREAT) {
            let index = free_slot.ok_or(KernelError::NoSpace)?;
            let entry = new_dir_entry(path, 0);
            self.write_dir_entry(&entry, index)?;
            self.file_from_entry(file, &entry, index);
            return Ok(());
        }

        Err(KernelError::NotFound)
    }

    fn read(&mut self, buf: &mut [u8], file: &mut File) -> KernelResult<usize> {
        let mut remaining = (buf.len() as u32).min(file.size.saturating_sub(file.pos));
        let mut total = 0usize;

        while remaining > 0 {
            let offset = file.pos % self.cluster_bytes;
            let sector = self.cluster_sector(file.cur_cluster);
            let cb = self.cluster_bytes as usize;

            let chunk = if offset == 0 && remaining == self.cluster_bytes {
                // Aligned whole cluster: straight into the caller's buffer
                let dst = &mut buf[total..total + cb];
                if self.dev.read_sectors(sector, dst)? != self.sectors_per_cluster {
                    return Ok(total);
                }
                self.cluster_bytes
            } else {
                let chunk = remaining.min(self.cluster_bytes - offset);

                self.cached_sector = None;
                if self.dev.read_sectors(sector, &mut self.buffer[..cb])?
                    != self.sectors_per_cluster
                {
                    return Ok(total);
                }
                buf[total..total + chunk as usize]
                    .copy_from_slice(&self.buffer[offset as usize..(offset + chunk) as usize]);
                chunk
            };

            total += chunk as usize;
            remaining -= chunk;
            if self.move_file_pos(file, chunk, false).is_err() {
                return Ok(total);
            }
        }

        Ok(total)
    }

    fn write(&mut self, buf: &[u8], file: &mut File) -> KernelResult<usize> {
        let len = buf.len() as u32;
        if file.pos + len > file.size {
            self.expand_file(file, file.pos + len - file.size)?;
        }

        let mut remaining = len;
        let mut total = 0usize;

        while remaining > 0 {
            let offset = file.pos % self.cluster_bytes;
            let sector = self.cluster_sector(file.cur_cluster);
            let cb = self.cluster_bytes as usize;

            let chunk = if offset == 0 && remaining == self.cluster_bytes {
                let src = &buf[total..total + cb];
                if self.dev.write_sectors(sector, src)? != self.sectors_per_cluster {
                    return Ok(total);
                }
                self.cluster_bytes
            } else {
                let chunk = remaining.min(self.cluster_bytes - offset);

                // Read-modify-write of the partial cluster
                self.cached_sector = None;
                if self.dev.read_sectors(sector, &mut self.buffer[..cb])?
                    != self.sectors_per_cluster
                {
                    return Ok(total);
                }
                self.buffer[offset as usize..(offset + chunk) as usize]
                    .copy_from_slice(&buf[total..total + chunk as usize]);
                if self.dev.write_sectors(sector, &self.buffer[..cb])?
                    != self.sectors_per_cluster
                {
                    return Ok(total);
                }
                chunk
            };

            total += chunk as usize;
            remaining -= chunk;
            if self.move_file_pos(file, chunk, true).is_err() {
                file.size = file.size.max(file.pos);
                return Ok(total);
            }
            file.size = file.size.max(file.pos);
        }

        Ok(total)
    }

    fn seek(&mut self, file: &mut File, offset: u32, whence: u32) -> KernelResult<()> {
        // Only seeks from the start are supported
        if whence != 0 {
            return Err(KernelError::InvalidArgument {
                what: "seek origin",
            });
        }

        let mut cluster = file.start_cluster;
        let mut pos = 0u32;
        let mut to_move = offset;

        while to_move > 0 {
            let in_cluster = pos % self.cluster_bytes;
            let step = to_move;

            if in_cluster + step < self.cluster_bytes {
                pos += step;
                break;
            }

            // Cross into the next cluster
            let step = self.cluster_bytes - in_cluster;
            pos += step;
            to_move -= step;

            cluster = self.next_cluster(cluster)?;
            if !cluster_is_valid(cluster) {
                return Err(KernelError::InvalidArgument {
                    what: "seek past the cluster chain",
                });
            }
        }

        file.pos = pos;
        file.cur_cluster = cluster;
        Ok(())
    }

    fn stat(&mut self, _file: &File, _st: &mut Stat) -> KernelResult<()> {
        Err(KernelError::NotSupported)
    }

    fn close(&mut self, file: &mut File) -> KernelResult<()> {
        // Read-only handles never dirty the directory entry
        if !file.mode.writable() {
            return Ok(());
        }

        let mut entry = self.read_dir_entry(file.dir_index)?;
        entry[28..32].copy_from_slice(&file.size.to_le_bytes());
        entry[20..22].copy_from_slice(&((file.start_cluster as u32 >> 16) as u16).to_le_bytes());
        entry[26..28].copy_from_slice(&file.start_cluster.to_le_bytes());
        self.write_dir_entry(&entry, file.dir_index)
    }

    fn opendir(&mut self, _path: &str, dir: &mut Dir) -> KernelResult<()> {
        dir.index = 0;
        Ok(())
    }

    fn readdir(&mut self, dir: &mut Dir, out: &mut Dirent) -> KernelResult<()> {
        while (dir.index as u32) < self.root_entries {
            let entry = self.read_dir_entry(dir.index as u32)?;

            if entry[0] == DIRENT_NAME_END {
                // Terminator: nothing beyond, the iterator stays put
                break;
            }

            if entry[0] != DIRENT_NAME_FREE {
                let ftype = entry_type(entry[11]);
                if matches!(ftype, FileType::Regular | FileType::Directory) {
                    out.index = dir.index;
                    dir.index += 1;
                    out.dtype = ftype as i32;
                    out.size =
                        u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]) as i32;

                    let mut name = [0u8; SFN_LEN + 2];
                    let len = sfn_display(&entry[..SFN_LEN], &mut name);
                    out.name = [0; super::DIRENT_NAME_LEN];
                    out.name[..len].copy_from_slice(&name[..len]);
                    return Ok(());
                }
            }

            dir.index += 1;
        }

        Err(KernelError::NotFound)
    }

    fn closedir(&mut self, _dir: &mut Dir) -> KernelResult<()> {
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> KernelResult<()> {
        for index in 0..self.root_entries {
            let entry = self.read_dir_entry(index)?;

            if entry[0] == DIRENT_NAME_END {
                break;
            }
            if entry[0] == DIRENT_NAME_FREE {
                continue;
            }

            if sfn_matches(&entry, path) {
                let hi = u16::from_le_bytes([entry[20], entry[21]]) as u32;
                let lo = u16::from_le_bytes([entry[26], entry[27]]) as u32;
                self.free_chain(((hi << 16) | lo) as u16)?;

                // Zeroed entry with the free marker up front; a bare zero
                // byte would read as the directory terminator and hide
                // everything behind it.
                let mut blank = [0u8; DIR_ENTRY_SIZE];
                blank[0] = DIRENT_NAME_FREE;
                return self.write_dir_entry(&blank, index);
            }
        }

        Err(KernelError::NotFound)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::blockdev::RamDisk;
    use super::super::FileSystem;
    use super::*;

    const SPC: u8 = 2; // 1 KiB clusters
    const FAT_SECTORS: u16 = 4; // 1024 cluster links per copy
    const ROOT_ENTRIES: u16 = 64;

    fn mkfs() -> Fat16Fs<RamDisk> {
        let mut disk = RamDisk::new(2100);
        let dbr = disk.bytes_mut();
        dbr[11..13].copy_from_slice(&512u16.to_le_bytes());
        dbr[13] = SPC;
        dbr[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved sectors
        dbr[16] = 2; // FAT copies
        dbr[17..19].copy_from_slice(&ROOT_ENTRIES.to_le_bytes());
        dbr[22..24].copy_from_slice(&FAT_SECTORS.to_le_bytes());
        dbr[54..62].copy_from_slice(b"FAT16   ");
        Fat16Fs::mount(disk).unwrap()
    }

    fn open_with(fs: &mut Fat16Fs<RamDisk>, path: &str, mode: OpenFlags) -> KernelResult<File> {
        let mut file = File::empty();
        file.mode = mode;
        file.set_name(path);
        fs.open(path, &mut file)?;
        Ok(file)
    }

    fn free_cluster_count(fs: &mut Fat16Fs<RamDisk>) -> usize {
        let total = FAT_SECTORS as u32 * 512 / 2;
        (2..total)
            .filter(|&c| fs.next_cluster(c as u16).unwrap() == CLUSTER_FREE)
            .count()
    }

    fn pattern(len: usize) -> std::vec::Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn mount_parses_geometry() {
        let fs = mkfs();
        assert_eq!(fs.cluster_bytes, 1024);
        assert_eq!(fs.fat_start, 1);
        assert_eq!(fs.root_start, 1 + 2 * FAT_SECTORS as u32);
        assert_eq!(fs.data_start, fs.root_start + ROOT_ENTRIES as u32 * 32 / 512);
    }

    #[test]
    fn mount_rejects_wrong_type_or_fat_count() {
        let mut disk = RamDisk::new(64);
        {
            let dbr = disk.bytes_mut();
            dbr[11..13].copy_from_slice(&512u16.to_le_bytes());
            dbr[13] = 1;
            dbr[14..16].copy_from_slice(&1u16.to_le_bytes());
            dbr[16] = 2;
            dbr[17..19].copy_from_slice(&16u16.to_le_bytes());
            dbr[22..24].copy_from_slice(&1u16.to_le_bytes());
            dbr[54..62].copy_from_slice(b"FAT12   ");
        }
        assert!(Fat16Fs::mount(disk).is_err());

        let mut disk = RamDisk::new(64);
        {
            let dbr = disk.bytes_mut();
            dbr[11..13].copy_from_slice(&512u16.to_le_bytes());
            dbr[13] = 1;
            dbr[14..16].copy_from_slice(&1u16.to_le_bytes());
            dbr[16] = 1; // one FAT copy only
            dbr[17..19].copy_from_slice(&16u16.to_le_bytes());
            dbr[22..24].copy_from_slice(&1u16.to_le_bytes());
            dbr[54..62].copy_from_slice(b"FAT16   ");
        }
        assert!(Fat16Fs::mount(disk).is_err());
    }

    #[test]
    fn sfn_conversion_and_display() {
        assert_eq!(&to_sfn("a.txt"), b"A       TXT");
        assert_eq!(&to_sfn("README"), b"README     ");
        assert_eq!(&to_sfn("longname.c"), b"LONGNAMEC  ");

        let mut out = [0u8; SFN_LEN + 2];
        let len = sfn_display(b"A       TXT", &mut out);
        assert_eq!(&out[..len], b"A.TXT");

        let len = sfn_display(b"README     ", &mut out);
        assert_eq!(&out[..len], b"README");
    }

    #[test]
    fn missing_file_without_creat_fails() {
        let mut fs = mkfs();
        assert_eq!(
            open_with(&mut fs, "nope.txt", OpenFlags::empty()).unwrap_err(),
            KernelError::NotFound
        );
    }

    #[test]
    fn create_write_read_roundtrip() {
        let mut fs = mkfs();
        let data = pattern(10_000);

        let mut file = open_with(
            &mut fs,
            "a.txt",
            OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY,
        )
        .unwrap();
        assert_eq!(fs.write(&data, &mut file).unwrap(), data.len());
        assert_eq!(file.size, 10_000);
        fs.close(&mut file).unwrap();

        let mut file = open_with(&mut fs, "a.txt", OpenFlags::empty()).unwrap();
        assert_eq!(file.size, 10_000);

        let mut back = std::vec![0u8; 10_000];
        assert_eq!(fs.read(&mut back, &mut file).unwrap(), 10_000);
        assert_eq!(back, data);

        // Directory listing shows the upper-cased 8.3 name and the size
        let mut dir = Dir::empty();
        fs.opendir("", &mut dir).unwrap();
        let mut out = Dirent::empty();
        fs.readdir(&mut dir, &mut out).unwrap();
        assert_eq!(&out.name[..5], b"A.TXT");
        assert_eq!(out.size, 10_000);
    }

    #[test]
    fn roundtrip_many_lengths() {
        let mut fs = mkfs();
        // Cluster boundary straddles: empty, sub-cluster, exact, exact+1
        for len in [0usize, 1, 513, 1023, 1024, 1025, 4096, 5000, 8192] {
            let name = "t.bin";
            let data = pattern(len);

            let mut file = open_with(
                &mut fs,
                name,
                OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY,
            )
            .unwrap();
            if len > 0 {
                assert_eq!(fs.write(&data, &mut file).unwrap(), len, "len {}", len);
            }
            fs.close(&mut file).unwrap();

            let mut file = open_with(&mut fs, name, OpenFlags::empty()).unwrap();
            assert_eq!(file.size as usize, len);
            let mut back = std::vec![0u8; len + 64];
            let got = fs.read(&mut back, &mut file).unwrap();
            assert_eq!(got, len, "short read for len {}", len);
            assert_eq!(&back[..len], &data[..], "data mismatch for len {}", len);
        }
    }

    #[test]
    fn write_at_offset_is_read_modify_write() {
        let mut fs = mkfs();
        let data = pattern(3000);

        let mut file = open_with(
            &mut fs,
            "rmw.bin",
            OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::RDWR,
        )
        .unwrap();
        fs.write(&data, &mut file).unwrap();

        fs.seek(&mut file, 1500, 0).unwrap();
        fs.write(&[0xEE; 10], &mut file).unwrap();
        assert_eq!(file.size, 3000, "overwrite does not grow the file");

        fs.seek(&mut file, 0, 0).unwrap();
        let mut back = std::vec![0u8; 3000];
        fs.read(&mut back, &mut file).unwrap();

        assert_eq!(&back[..1500], &data[..1500]);
        assert_eq!(&back[1500..1510], &[0xEE; 10]);
        assert_eq!(&back[1510..], &data[1510..]);
    }

    #[test]
    fn growing_write_from_a_rewound_position_extends_the_tail() {
        let mut fs = mkfs();
        let first = pattern(3000);

        let mut file = open_with(
            &mut fs,
            "grow.bin",
            OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::RDWR,
        )
        .unwrap();
        fs.write(&first, &mut file).unwrap();

        // Rewind to the head, then overwrite past the old end
        fs.seek(&mut file, 0, 0).unwrap();
        let second = pattern(4000);
        assert_eq!(fs.write(&second, &mut file).unwrap(), 4000);
        assert_eq!(file.size, 4000);

        fs.seek(&mut file, 0, 0).unwrap();
        let mut back = std::vec![0u8; 4000];
        assert_eq!(fs.read(&mut back, &mut file).unwrap(), 4000);
        assert_eq!(back, second);
    }

    #[test]
    fn seek_walks_the_chain() {
        let mut fs = mkfs();
        let data = pattern(3000);

        let mut file = open_with(
            &mut fs,
            "s.bin",
            OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::RDWR,
        )
        .unwrap();
        fs.write(&data, &mut file).unwrap();

        fs.seek(&mut file, 2500, 0).unwrap();
        assert_eq!(file.pos, 2500);
        let mut slice = [0u8; 100];
        fs.read(&mut slice, &mut file).unwrap();
        assert_eq!(&slice[..], &data[2500..2600]);

        // Only origin 0 is supported
        assert!(fs.seek(&mut file, 0, 1).is_err());
        // Past the chain
        assert!(fs.seek(&mut file, 100_000, 0).is_err());
    }

    #[test]
    fn truncate_releases_clusters_and_resets_size() {
        let mut fs = mkfs();
        let baseline = free_cluster_count(&mut fs);

        let mut file = open_with(
            &mut fs,
            "t.txt",
            OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY,
        )
        .unwrap();
        fs.write(&pattern(5000), &mut file).unwrap();
        fs.close(&mut file).unwrap();
        assert!(free_cluster_count(&mut fs) < baseline);

        let mut file = open_with(
            &mut fs,
            "t.txt",
            OpenFlags::TRUNC | OpenFlags::WRONLY,
        )
        .unwrap();
        assert_eq!(file.size, 0);
        assert_eq!(
            free_cluster_count(&mut fs),
            baseline,
            "truncation returned every cluster"
        );
        fs.close(&mut file).unwrap();
    }

    #[test]
    fn unlink_returns_clusters_and_removes_entry() {
        let mut fs = mkfs();
        let baseline = free_cluster_count(&mut fs);

        let mut file = open_with(
            &mut fs,
            "gone.txt",
            OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY,
        )
        .unwrap();
        fs.write(&pattern(4096), &mut file).unwrap();
        fs.close(&mut file).unwrap();

        fs.unlink("gone.txt").unwrap();
        assert_eq!(
            free_cluster_count(&mut fs),
            baseline,
            "cluster accounting unchanged after create+unlink"
        );
        assert_eq!(
            open_with(&mut fs, "gone.txt", OpenFlags::empty()).unwrap_err(),
            KernelError::NotFound
        );
        assert_eq!(fs.unlink("gone.txt").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn readdir_skips_freed_entries_and_stops_at_end() {
        let mut fs = mkfs();

        for name in ["one.txt", "two.txt", "three.txt"] {
            let mut file = open_with(
                &mut fs,
                name,
                OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY,
            )
            .unwrap();
            fs.close(&mut file).unwrap();
        }
        fs.unlink("one.txt").unwrap();

        let mut dir = Dir::empty();
        fs.opendir("", &mut dir).unwrap();

        let mut names = std::vec::Vec::new();
        let mut out = Dirent::empty();
        while fs.readdir(&mut dir, &mut out).is_ok() {
            let len = out.name.iter().position(|&b| b == 0).unwrap();
            names.push(std::string::String::from_utf8(out.name[..len].to_vec()).unwrap());
        }

        assert_eq!(names, ["TWO.TXT", "THREE.TXT"]);
    }

    #[test]
    fn creat_reuses_freed_directory_slots() {
        let mut fs = mkfs();

        let mut a = open_with(
            &mut fs,
            "a.txt",
            OpenFlags::CREAT | OpenFlags::WRONLY,
        )
        .unwrap();
        let slot_a = a.dir_index;
        fs.close(&mut a).unwrap();
        let mut b = open_with(
            &mut fs,
            "b.txt",
            OpenFlags::CREAT | OpenFlags::WRONLY,
        )
        .unwrap();
        fs.close(&mut b).unwrap();

        fs.unlink("a.txt").unwrap();
        let c = open_with(
            &mut fs,
            "c.txt",
            OpenFlags::CREAT | OpenFlags::WRONLY,
        )
        .unwrap();
        assert_eq!(c.dir_index, slot_a, "freed slot is eligible for creation");
    }

    #[test]
    fn fat_copies_stay_identical() {
        let mut fs = mkfs();

        let mut file = open_with(
            &mut fs,
            "mirror.bin",
            OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::WRONLY,
        )
        .unwrap();
        fs.write(&pattern(4000), &mut file).unwrap();
        fs.close(&mut file).unwrap();
        fs.unlink("mirror.bin").unwrap();

        let fat_bytes = FAT_SECTORS as usize * 512;
        let image = fs.dev.bytes();
        let fat0 = &image[512..512 + fat_bytes];
        let fat1 = &image[512 + fat_bytes..512 + 2 * fat_bytes];
        assert_eq!(fat0, fat1);
    }

    #[test]
    fn alloc_chain_links_and_terminates() {
        let mut fs = mkfs();

        let start = fs.alloc_chain(3).unwrap();
        assert!(cluster_is_valid(start));

        let second = fs.next_cluster(start).unwrap();
        let third = fs.next_cluster(second).unwrap();
        assert!(cluster_is_valid(second) && cluster_is_valid(third));
        assert!(fs.next_cluster(third).unwrap() >= CLUSTER_END_MIN);

        let before = free_cluster_count(&mut fs);
        fs.free_chain(start).unwrap();
        assert_eq!(free_cluster_count(&mut fs), before + 3);
    }

    #[test]
    fn chain_exhaustion_reports_no_space_and_unwinds() {
        let mut fs = mkfs();
        let total = free_cluster_count(&mut fs) as u32;

        assert_eq!(
            fs.alloc_chain(total + 1).unwrap_err(),
            KernelError::NoSpace
        );
        assert_eq!(
            free_cluster_count(&mut fs) as u32,
            total,
            "failed allocation returned everything it claimed"
        );
    }
}
