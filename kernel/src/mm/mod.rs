//! Memory management
//!
//! `frame_allocator` owns physical frames, `vas` owns page tables; everything
//! else in the kernel asks these two for memory.

pub mod bitmap;
pub mod frame_allocator;
pub mod page_table;
pub mod vas;

pub use page_table::{PageFlags, PAGE_SIZE};
pub use vas::{AddressSpace, USER_BASE, USER_STACK_TOP};

/// Start of the extended memory the allocator manages (1 MiB).
pub const MEM_EXT_START: u32 = 0x10_0000;

/// End of the identity-mapped kernel window over extended memory.
pub const MEM_EXT_END: u32 = 0x800_0000;

/// Start of the extended BIOS data area; low-RAM mappings stop here.
pub const EBDA_START: u32 = 0x9_FC00;

/// VGA text-mode window, identity mapped for the console driver.
pub const CONSOLE_BASE: u32 = 0xB_8000;
pub const CONSOLE_END: u32 = 0xC_0000;

/// Bring up physical memory and the kernel page table, then switch to it.
///
/// Runs once, before the scheduler; the loader's 4 MiB identity map is live
/// until the final CR3 load.
#[cfg(target_arch = "x86")]
pub fn init(boot_info: &crate::bootinfo::BootInfo) {
    use page_table::{page_align_down, page_align_up};

    extern "C" {
        static __kernel_end: u8;
    }

    log::info!("mem init");
    for (i, region) in boot_info.regions().enumerate() {
        log::info!("  region[{}]: {:#x} + {:#x}", i, region.start, region.size);
    }

    // Everything above 1 MiB, page aligned, goes to the frame allocator.
    let up1m_free = page_align_down(boot_info.total_ram() - MEM_EXT_START);
    frame_allocator::init(MEM_EXT_START, up1m_free);

    // The kernel image (text, data, BSS including the frame bitmap) starts
    // life in use.
    // SAFETY: linker-provided symbol marking the end of the kernel image.
    let kernel_end = page_align_up(unsafe { &__kernel_end as *const u8 as u32 });
    frame_allocator::reserve(MEM_EXT_START, kernel_end - MEM_EXT_START);

    log::info!(
        "mem: {} frames free above {:#x}",
        frame_allocator::free_frames(),
        MEM_EXT_START
    );

    create_kernel_table();
    crate::arch::set_page_dir(vas::kernel_dir_paddr());
}

/// Build the canonical kernel directory: identity mappings with attributes,
/// kernel text read-only.
#[cfg(target_arch = "x86")]
fn create_kernel_table() {
    use page_table::{page_align_down, page_align_up};

    extern "C" {
        static __text_start: u8;
        static __text_end: u8;
    }

    // SAFETY: linker-provided section bounds, page aligned by the kernel
    // linker script.
    let (text_start, text_end) = unsafe {
        (
            &__text_start as *const u8 as u32,
            &__text_end as *const u8 as u32,
        )
    };

    let w = PageFlags::WRITABLE;
    // (virtual start, virtual end, physical start, attributes)
    let kernel_map: [(u32, u32, u32, PageFlags); 5] = [
        // Low RAM: IVT, loader scratch, early stacks
        (0, EBDA_START, 0, w),
        // VGA text window
        (CONSOLE_BASE, CONSOLE_END, CONSOLE_BASE, w),
        // Kernel image head up to text
        (MEM_EXT_START, text_start, MEM_EXT_START, w),
        // Kernel code, read-only
        (text_start, text_end, text_start, PageFlags::empty()),
        // Kernel data + the rest of the identity window
        (text_end, MEM_EXT_END, text_end, w),
    ];

    let dir = vas::kernel_dir_paddr();
    for (vstart, vend, pstart, flags) in kernel_map {
        if vstart >= vend {
            continue;
        }
        let vstart = page_align_down(vstart);
        let vend = page_align_up(vend);
        let pages = (vend - vstart) / PAGE_SIZE;

        if vas::create_map(dir, vstart, page_align_down(pstart), pages, flags).is_err() {
            panic!("kernel table construction ran out of frames");
        }
    }
}
