//! Host-target fallbacks
//!
//! Unit tests run on the build host, where there is no interrupt flag to
//! save, no CR3 and no GDT. These stand-ins keep the portable kernel logic
//! exercisable: selector allocation hands out unique values, everything else
//! is inert.

use core::sync::atomic::{AtomicU16, Ordering};

use crate::error::KernelResult;

pub const KERNEL_CODE_SEL: u16 = 1 << 3;
pub const KERNEL_DATA_SEL: u16 = 2 << 3;
pub const SYSCALL_GATE_SEL: u16 = 3 << 3;

pub fn irq_save() -> u32 {
    0
}

pub fn irq_restore(_flags: u32) {}

pub fn halt() {}

pub fn set_page_dir(_paddr: u32) {}

pub fn load_task_register(_sel: u16) {}

pub fn switch_task(_tss_sel: u16) {}

pub fn enter_user_mode(_eip: u32, _esp: u32, _cs: u32, _ds: u32, _eflags: u32) -> ! {
    unreachable!("no user mode on the host target")
}

static NEXT_SEL: AtomicU16 = AtomicU16::new(4);

pub fn tss_selector_alloc(_tss_base: u32) -> KernelResult<u16> {
    Ok(NEXT_SEL.fetch_add(1, Ordering::Relaxed) << 3)
}

pub fn selector_free(_sel: u16) {}

pub fn user_segments_alloc() -> KernelResult<(u16, u16)> {
    let code = NEXT_SEL.fetch_add(1, Ordering::Relaxed) << 3;
    let data = NEXT_SEL.fetch_add(1, Ordering::Relaxed) << 3;
    Ok((code | super::RPL_USER, data | super::RPL_USER))
}
