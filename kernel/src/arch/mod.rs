//! Architecture support
//!
//! Real hardware glue lives in the `x86` submodule and is only compiled for
//! the 32-bit protected-mode target. Host builds (unit tests) get inert
//! fallbacks so the portable kernel logic compiles and runs unmodified.

pub mod tss;

#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(target_arch = "x86")]
pub use self::x86::{
    enter_user_mode, halt, irq_restore, irq_save, load_task_register, selector_free, set_page_dir,
    switch_task, tss_selector_alloc, user_segments_alloc, KERNEL_CODE_SEL, KERNEL_DATA_SEL,
    SYSCALL_GATE_SEL,
};

#[cfg(not(target_arch = "x86"))]
mod host;

#[cfg(not(target_arch = "x86"))]
pub use self::host::{
    enter_user_mode, halt, irq_restore, irq_save, load_task_register, selector_free, set_page_dir,
    switch_task, tss_selector_alloc, user_segments_alloc, KERNEL_CODE_SEL, KERNEL_DATA_SEL,
    SYSCALL_GATE_SEL,
};

/// Requested privilege level for user-mode selectors
pub const RPL_USER: u16 = 3;
