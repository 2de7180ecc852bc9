//! Kernel binary entry
//!
//! The loader jumps here with a pointer to its boot-info structure. The
//! structure is copied out immediately; loader memory is dead afterwards.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod entry {
    use lumen_kernel::bootinfo::BootInfo;

    #[no_mangle]
    pub extern "C" fn _start(boot_info: *const BootInfo) -> ! {
        let info = if boot_info.is_null() {
            BootInfo::empty()
        } else {
            // SAFETY: the loader passes a readable BootInfo per the boot
            // contract; it is copied before any allocator can reuse it.
            unsafe { core::ptr::read(boot_info) }
        };

        lumen_kernel::kernel_main(&info)
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        let _ = lumen_kernel::arch::irq_save();
        log::error!("kernel panic: {}", info);
        loop {
            lumen_kernel::arch::halt();
        }
    }
}

/// Host builds only exist so `cargo test` links; the kernel never runs here.
#[cfg(not(target_os = "none"))]
fn main() {}
