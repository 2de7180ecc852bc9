//! Minimal ELF32 reader for exec
//!
//! Little-endian, 32-bit, i386 executables only; just enough to find the
//! entry point and the LOAD segments. Fields are read byte-wise so the
//! on-disk layout is decoded identically on any build target.

use crate::error::{KernelError, KernelResult};

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// e_type: executable file
pub const ET_EXEC: u16 = 2;

/// e_machine: Intel 386
pub const EM_386: u16 = 3;

/// p_type: loadable segment
pub const PT_LOAD: u32 = 1;

pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Validated ELF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    pub entry: u32,
    pub phoff: u32,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    /// Parse and validate the 52-byte file header.
    pub fn parse(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < EHDR_SIZE {
            return Err(KernelError::BadExecutable);
        }
        if bytes[..4] != ELF_MAGIC {
            return Err(KernelError::BadExecutable);
        }

        let e_type = read_u16(bytes, 16);
        let e_machine = read_u16(bytes, 18);
        let entry = read_u32(bytes, 24);
        let phoff = read_u32(bytes, 28);
        let phentsize = read_u16(bytes, 42);
        let phnum = read_u16(bytes, 44);

        // Executable, for the 386, with an entry point and program headers
        if e_type != ET_EXEC || e_machine != EM_386 || entry == 0 {
            return Err(KernelError::BadExecutable);
        }
        if phoff == 0 || phentsize == 0 || phnum == 0 {
            return Err(KernelError::BadExecutable);
        }

        Ok(Self {
            entry,
            phoff,
            phentsize,
            phnum,
        })
    }
}

/// One program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub filesz: u32,
    pub memsz: u32,
}

impl ProgramHeader {
    pub fn parse(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < PHDR_SIZE {
            return Err(KernelError::BadExecutable);
        }

        Ok(Self {
            p_type: read_u32(bytes, 0),
            offset: read_u32(bytes, 4),
            vaddr: read_u32(bytes, 8),
            filesz: read_u32(bytes, 16),
            memsz: read_u32(bytes, 20),
        })
    }

    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}
