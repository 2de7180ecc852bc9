//! Physical frame allocator
//!
//! One bitmap over all RAM above 1 MiB, 4 KiB granularity, lowest-fit run
//! allocation. The global instance is guarded by a kernel mutex; nothing may
//! block while holding it.

use core::cell::UnsafeCell;

use crate::error::{KernelError, KernelResult};
use crate::sched::sync::KLock;

use super::bitmap::{byte_count, Bitmap};
use super::page_table::PAGE_SIZE;

/// Worst case frame population: 4 GiB of 4 KiB frames.
const MAX_FRAMES: usize = 1 << 20;

/// Bitmap bytes for the worst case (128 KiB, kernel BSS).
const BITMAP_BYTES: usize = byte_count(MAX_FRAMES);

/// Bitmap-backed allocator over a contiguous physical range.
pub struct FrameAllocator<'a> {
    base: u32,
    frame_count: usize,
    free_count: usize,
    bitmap: Bitmap<'a>,
}

impl<'a> FrameAllocator<'a> {
    /// Track `size` bytes of physical memory starting at `base`.
    ///
    /// `base` and `size` must be page aligned; every frame starts free.
    pub fn new(bits: &'a mut [u8], base: u32, size: u32) -> Self {
        debug_assert_eq!(base % PAGE_SIZE, 0);
        debug_assert_eq!(size % PAGE_SIZE, 0);

        let frame_count = (size / PAGE_SIZE) as usize;
        Self {
            base,
            frame_count,
            free_count: frame_count,
            bitmap: Bitmap::new(bits, frame_count, false),
        }
    }

    pub fn total_frames(&self) -> usize {
        self.frame_count
    }

    pub fn free_frames(&self) -> usize {
        self.free_count
    }

    /// Allocate `count` contiguous frames; returns the physical base address.
    pub fn alloc_pages(&mut self, count: usize) -> KernelResult<u32> {
        let index = self
            .bitmap
            .alloc_run(count, false)
            .ok_or(KernelError::OutOfMemory {
                resource: "physical frames",
            })?;
        self.free_count -= count;
        Ok(self.base + (index as u32) * PAGE_SIZE)
    }

    /// Release `count` frames starting at `addr`.
    pub fn free_pages(&mut self, addr: u32, count: usize) {
        assert!(addr >= self.base, "freeing frame below managed range");
        let index = ((addr - self.base) / PAGE_SIZE) as usize;
        assert!(index + count <= self.frame_count);

        self.bitmap.set_range(index, count, false);
        self.free_count += count;
    }

    /// Mark `[addr, addr + size)` as in use without going through allocation.
    ///
    /// Used at init for the kernel image and the bitmap itself.
    pub fn reserve(&mut self, addr: u32, size: u32) {
        if addr < self.base {
            return;
        }
        let index = ((addr - self.base) / PAGE_SIZE) as usize;
        let count = (super::page_table::page_align_up(size) / PAGE_SIZE) as usize;
        let count = count.min(self.frame_count - index);

        self.bitmap.set_range(index, count, true);
        self.free_count -= count;
    }
}

struct BitmapStorage(UnsafeCell<[u8; BITMAP_BYTES]>);

// SAFETY: handed out exactly once, by init(), before the scheduler runs.
unsafe impl Sync for BitmapStorage {}

static BITMAP_STORAGE: BitmapStorage = BitmapStorage(UnsafeCell::new([0; BITMAP_BYTES]));

static FRAME_ALLOC: KLock<Option<FrameAllocator<'static>>> = KLock::new(None);

/// Bring up the global allocator over `[base, base + size)`.
///
/// Called once during `mm::init`, before any other task exists.
pub fn init(base: u32, size: u32) {
    // SAFETY: init runs once, single threaded, and the storage reference is
    // moved into the allocator which lives for the rest of the kernel.
    let bits: &'static mut [u8] = unsafe { &mut *BITMAP_STORAGE.0.get() };

    let mut guard = FRAME_ALLOC.lock();
    assert!(guard.is_none(), "frame allocator initialized twice");
    *guard = Some(FrameAllocator::new(bits, base, size));
}

fn with_alloc<R>(f: impl FnOnce(&mut FrameAllocator<'static>) -> R) -> R {
    let mut guard = FRAME_ALLOC.lock();
    match guard.as_mut() {
        Some(alloc) => f(alloc),
        None => panic!("frame allocator not initialized"),
    }
}

/// Allocate `count` contiguous frames.
pub fn alloc_pages(count: usize) -> KernelResult<u32> {
    with_alloc(|a| a.alloc_pages(count))
}

/// Allocate a single frame.
pub fn alloc_page() -> KernelResult<u32> {
    alloc_pages(1)
}

/// Free `count` frames starting at `addr`.
pub fn free_pages(addr: u32, count: usize) {
    with_alloc(|a| a.free_pages(addr, count))
}

/// Free a single frame.
pub fn free_page(addr: u32) {
    free_pages(addr, 1)
}

/// Reserve a physical range at init time (kernel image, bitmap).
pub fn reserve(addr: u32, size: u32) {
    with_alloc(|a| a.reserve(addr, size))
}

/// Free-frame count, for boot logging and diagnostics.
pub fn free_frames() -> usize {
    with_alloc(|a| a.free_frames())
}

/// Total tracked frames.
pub fn total_frames() -> usize {
    with_alloc(|a| a.total_frames())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn small_alloc(storage: &mut [u8]) -> FrameAllocator<'_> {
        // 64 frames starting at 1 MiB
        FrameAllocator::new(storage, 0x10_0000, 64 * PAGE_SIZE)
    }

    #[test]
    fn alloc_returns_lowest_base() {
        let mut storage = [0u8; byte_count(64)];
        let mut alloc = small_alloc(&mut storage);

        assert_eq!(alloc.alloc_pages(1).unwrap(), 0x10_0000);
        assert_eq!(alloc.alloc_pages(2).unwrap(), 0x10_1000);
        assert_eq!(alloc.free_frames(), 61);
    }

    #[test]
    fn allocations_are_disjoint() {
        let mut storage = [0u8; byte_count(64)];
        let mut alloc = small_alloc(&mut storage);

        let mut ranges = std::vec::Vec::new();
        for count in [4usize, 1, 7, 2, 16] {
            let base = alloc.alloc_pages(count).unwrap();
            ranges.push((base, base + count as u32 * PAGE_SIZE));
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                assert!(a.1 <= b.0 || b.1 <= a.0, "ranges {:x?} and {:x?} overlap", a, b);
            }
        }
    }

    #[test]
    fn accounting_balances() {
        let mut storage = [0u8; byte_count(64)];
        let mut alloc = small_alloc(&mut storage);
        let total = alloc.total_frames();

        let a = alloc.alloc_pages(10).unwrap();
        let b = alloc.alloc_pages(5).unwrap();
        assert_eq!(alloc.free_frames() + 15, total);

        alloc.free_pages(a, 10);
        alloc.free_pages(b, 5);
        assert_eq!(alloc.free_frames(), total);
    }

    #[test]
    fn freed_range_is_reallocated() {
        let mut storage = [0u8; byte_count(64)];
        let mut alloc = small_alloc(&mut storage);

        let a = alloc.alloc_pages(8).unwrap();
        alloc.free_pages(a, 8);
        assert_eq!(alloc.alloc_pages(8).unwrap(), a);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut storage = [0u8; byte_count(64)];
        let mut alloc = small_alloc(&mut storage);

        assert!(alloc.alloc_pages(64).is_ok());
        assert_eq!(
            alloc.alloc_pages(1),
            Err(KernelError::OutOfMemory {
                resource: "physical frames"
            })
        );
    }

    #[test]
    fn reserve_excludes_frames() {
        let mut storage = [0u8; byte_count(64)];
        let mut alloc = small_alloc(&mut storage);

        alloc.reserve(0x10_0000, 4 * PAGE_SIZE);
        assert_eq!(alloc.free_frames(), 60);
        assert_eq!(alloc.alloc_pages(1).unwrap(), 0x10_4000);
    }
}
