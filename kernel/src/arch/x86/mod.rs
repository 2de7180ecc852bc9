//! 32-bit protected-mode glue
//!
//! Interrupt-flag save/restore, CR3 loads, the hardware task switch and the
//! GDT live here. Everything above this module is architecture-neutral.

pub mod gdt;

pub use gdt::{
    selector_free, tss_selector_alloc, user_segments_alloc, KERNEL_CODE_SEL, KERNEL_DATA_SEL,
    SYSCALL_GATE_SEL,
};

/// Save EFLAGS and disable interrupts.
///
/// On a uniprocessor, a cleared interrupt flag is mutual exclusion; the
/// scheduler's critical-section guard is built on this pair.
pub fn irq_save() -> u32 {
    let flags: u32;
    // SAFETY: pushfd/pop reads EFLAGS into a register and cli clears IF;
    // neither touches memory beyond the stack push/pop pair.
    unsafe {
        core::arch::asm!(
            "pushfd",
            "pop {0}",
            "cli",
            out(reg) flags,
            options(nomem, preserves_flags)
        );
    }
    flags
}

/// Restore a previously saved EFLAGS image (and with it the interrupt flag).
pub fn irq_restore(flags: u32) {
    // SAFETY: restores the exact flags image produced by irq_save.
    unsafe {
        core::arch::asm!(
            "push {0}",
            "popfd",
            in(reg) flags,
            options(nomem)
        );
    }
}

/// Halt until the next interrupt.
pub fn halt() {
    // SAFETY: hlt with interrupts enabled idles the CPU; the idle task is the
    // only caller.
    unsafe { x86::halt() };
}

/// Load CR3 with a page-directory physical address.
pub fn set_page_dir(paddr: u32) {
    // SAFETY: the caller passes a 4 KiB-aligned directory that maps the
    // kernel window; loading it cannot remove the executing code's mapping.
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) paddr, options(nostack, preserves_flags));
    }
}

/// Load the task register with the running task's TSS selector.
pub fn load_task_register(sel: u16) {
    // SAFETY: sel indexes a present TSS descriptor written by the GDT module.
    unsafe { x86::task::load_tr(x86::segmentation::SegmentSelector::from_raw(sel)) };
}

/// Hardware task switch: far jump through a TSS selector.
///
/// The CPU stores the outgoing register state into the current TSS and loads
/// the incoming one; execution resumes here when the outgoing task is
/// switched back in.
pub fn switch_task(tss_sel: u16) {
    let target: [u32; 2] = [0, tss_sel as u32];
    // SAFETY: target is a 6-byte far pointer {offset, selector} and the
    // selector names a present, non-busy TSS descriptor.
    unsafe {
        core::arch::asm!("jmp fword ptr [{0}]", in(reg) &target);
    }
}

/// First drop to ring 3: load the user data segments and `iretd` onto the
/// task's stack and entry point. Only used to start the first task; every
/// later transition happens through the hardware task switch.
pub fn enter_user_mode(eip: u32, esp: u32, cs: u32, ds: u32, eflags: u32) -> ! {
    // SAFETY: selectors come from the GDT module, eip/esp from a freshly
    // built user mapping; iretd with a ring-3 cs never returns here.
    unsafe {
        core::arch::asm!(
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov fs, {ds:x}",
            "mov gs, {ds:x}",
            "push {ds:e}",
            "push {esp:e}",
            "push {eflags:e}",
            "push {cs:e}",
            "push {eip:e}",
            "iretd",
            ds = in(reg) ds,
            esp = in(reg) esp,
            eflags = in(reg) eflags,
            cs = in(reg) cs,
            eip = in(reg) eip,
            options(noreturn)
        );
    }
}

/// Read one byte from an I/O port.
///
/// # Safety
///
/// Port I/O has device-defined side effects; the caller must own the device
/// at this port.
pub unsafe fn inb(port: u16) -> u8 {
    // SAFETY: forwarded to the caller's contract.
    unsafe { x86::io::inb(port) }
}

/// Write one byte to an I/O port.
///
/// # Safety
///
/// See [`inb`].
pub unsafe fn outb(port: u16, value: u8) {
    // SAFETY: forwarded to the caller's contract.
    unsafe { x86::io::outb(port, value) }
}

/// Read one 16-bit word from an I/O port.
///
/// # Safety
///
/// See [`inb`].
pub unsafe fn inw(port: u16) -> u16 {
    // SAFETY: forwarded to the caller's contract.
    unsafe { x86::io::inw(port) }
}

/// Write one 16-bit word to an I/O port.
///
/// # Safety
///
/// See [`inb`].
pub unsafe fn outw(port: u16, value: u16) {
    // SAFETY: forwarded to the caller's contract.
    unsafe { x86::io::outw(port, value) }
}
