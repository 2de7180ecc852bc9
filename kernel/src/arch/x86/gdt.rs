//! Global descriptor table
//!
//! Fixed 256-entry table: null, kernel flat code/data, the syscall call
//! gate, then dynamically allocated slots (one TSS descriptor per task plus
//! the shared user code/data pair). Slot allocation is a linear scan under a
//! spin lock; it never blocks, so it is safe from any context.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

const GDT_ENTRIES: usize = 256;

/// Index of the first dynamically allocatable slot
const FIRST_DYNAMIC: usize = 4;

pub const KERNEL_CODE_SEL: u16 = 1 << 3;
pub const KERNEL_DATA_SEL: u16 = 2 << 3;
pub const SYSCALL_GATE_SEL: u16 = 3 << 3;

// Access-byte pieces
const ACCESS_PRESENT: u8 = 1 << 7;
const ACCESS_DPL3: u8 = 3 << 5;
const ACCESS_SEGMENT: u8 = 1 << 4;
const ACCESS_CODE_RX: u8 = 0xA;
const ACCESS_DATA_RW: u8 = 0x2;
const ACCESS_TSS32: u8 = 0x9;
const ACCESS_CALL_GATE32: u8 = 0xC;

// Flags nibble
const FLAG_GRANULARITY_4K: u8 = 1 << 3;
const FLAG_DEFAULT_32: u8 = 1 << 2;

struct GdtTable {
    entries: [u64; GDT_ENTRIES],
    used: [bool; GDT_ENTRIES],
}

static GDT: Mutex<GdtTable> = Mutex::new(GdtTable {
    entries: [0; GDT_ENTRIES],
    used: [false; GDT_ENTRIES],
});

/// Encode a segment descriptor.
fn encode_segment(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | ((access as u64) << 40)
        | (((limit >> 16) & 0xF) << 48)
        | (((flags as u64) & 0xF) << 52)
        | (((base >> 24) & 0xFF) << 56)
}

/// Encode a call-gate descriptor.
fn encode_call_gate(selector: u16, offset: u32, access: u8, param_words: u8) -> u64 {
    let offset = offset as u64;
    (offset & 0xFFFF)
        | ((selector as u64) << 16)
        | (((param_words as u64) & 0x1F) << 32)
        | ((access as u64) << 40)
        | ((offset >> 16) << 48)
}

/// Build the static entries and load GDTR.
///
/// Called once, before interrupts are enabled.
pub fn init() {
    let mut gdt = GDT.lock();

    gdt.entries[0] = 0;
    gdt.entries[1] = encode_segment(
        0,
        0xF_FFFF,
        ACCESS_PRESENT | ACCESS_SEGMENT | ACCESS_CODE_RX,
        FLAG_GRANULARITY_4K | FLAG_DEFAULT_32,
    );
    gdt.entries[2] = encode_segment(
        0,
        0xF_FFFF,
        ACCESS_PRESENT | ACCESS_SEGMENT | ACCESS_DATA_RW,
        FLAG_GRANULARITY_4K | FLAG_DEFAULT_32,
    );
    for i in 0..FIRST_DYNAMIC {
        gdt.used[i] = true;
    }

    let pointer = x86::dtables::DescriptorTablePointer {
        limit: (GDT_ENTRIES * 8 - 1) as u16,
        base: gdt.entries.as_ptr(),
    };
    // SAFETY: the table is a static with kernel-flat code/data descriptors at
    // the selectors the running code already uses.
    unsafe { x86::dtables::lgdt(&pointer) };
}

/// Install the syscall call gate: DPL3 so user code may call through it,
/// targeting kernel code, copying `param_words` argument words.
pub fn install_syscall_gate(handler: u32, param_words: u8) {
    let mut gdt = GDT.lock();
    gdt.entries[(SYSCALL_GATE_SEL >> 3) as usize] = encode_call_gate(
        KERNEL_CODE_SEL,
        handler,
        ACCESS_PRESENT | ACCESS_DPL3 | ACCESS_CALL_GATE32,
        param_words,
    );
}

fn alloc_slot(gdt: &mut GdtTable) -> KernelResult<usize> {
    for i in FIRST_DYNAMIC..GDT_ENTRIES {
        if !gdt.used[i] {
            gdt.used[i] = true;
            return Ok(i);
        }
    }
    Err(KernelError::OutOfMemory {
        resource: "GDT slots",
    })
}

/// Allocate a slot and write a 32-bit TSS descriptor for `tss_base`.
pub fn tss_selector_alloc(tss_base: u32) -> KernelResult<u16> {
    let mut gdt = GDT.lock();
    let slot = alloc_slot(&mut gdt)?;
    gdt.entries[slot] = encode_segment(
        tss_base,
        (core::mem::size_of::<super::super::tss::TaskStateSegment>() - 1) as u32,
        ACCESS_PRESENT | ACCESS_TSS32,
        0,
    );
    Ok((slot as u16) << 3)
}

/// Allocate the shared DPL3 flat code/data pair for user tasks.
///
/// Returns the selectors with RPL3 already or-ed in.
pub fn user_segments_alloc() -> KernelResult<(u16, u16)> {
    let mut gdt = GDT.lock();

    let code_slot = alloc_slot(&mut gdt)?;
    gdt.entries[code_slot] = encode_segment(
        0,
        0xF_FFFF,
        ACCESS_PRESENT | ACCESS_DPL3 | ACCESS_SEGMENT | ACCESS_CODE_RX,
        FLAG_GRANULARITY_4K | FLAG_DEFAULT_32,
    );

    let data_slot = match alloc_slot(&mut gdt) {
        Ok(slot) => slot,
        Err(e) => {
            gdt.used[code_slot] = false;
            gdt.entries[code_slot] = 0;
            return Err(e);
        }
    };
    gdt.entries[data_slot] = encode_segment(
        0,
        0xF_FFFF,
        ACCESS_PRESENT | ACCESS_DPL3 | ACCESS_SEGMENT | ACCESS_DATA_RW,
        FLAG_GRANULARITY_4K | FLAG_DEFAULT_32,
    );

    let rpl = crate::arch::RPL_USER;
    Ok((
        ((code_slot as u16) << 3) | rpl,
        ((data_slot as u16) << 3) | rpl,
    ))
}

/// Return a dynamically allocated selector to the free pool.
pub fn selector_free(sel: u16) {
    let slot = (sel >> 3) as usize;
    if slot < FIRST_DYNAMIC || slot >= GDT_ENTRIES {
        return;
    }
    let mut gdt = GDT.lock();
    gdt.used[slot] = false;
    gdt.entries[slot] = 0;
}
