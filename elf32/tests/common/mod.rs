//! Shared helpers for loader integration tests.

#![allow(dead_code)]

use kpio_elf32::{MapSegment, Segment};

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;
pub const PF_R: u32 = 4;
pub const PF_W: u32 = 2;
pub const PF_X: u32 = 1;

/// One program header: p_type, p_offset, p_vaddr, p_paddr, p_filesz,
/// p_memsz, p_flags, p_align.
pub type Phdr = [u32; 8];

/// Host-endian ELF32 image: header, program header table at 52, payload.
pub fn create_elf(entry: u32, phdrs: &[Phdr], payload: &[u8]) -> Vec<u8> {
    let mut elf = vec![0u8; 52];
    elf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    elf[4] = 1; // ELFCLASS32
    elf[5] = if cfg!(target_endian = "big") { 2 } else { 1 };
    elf[6] = 1; // EV_CURRENT
    elf[16..18].copy_from_slice(&2u16.to_ne_bytes()); // ET_EXEC
    elf[20..24].copy_from_slice(&1u32.to_ne_bytes());
    elf[24..28].copy_from_slice(&entry.to_ne_bytes());
    elf[28..32].copy_from_slice(&52u32.to_ne_bytes());
    elf[40..42].copy_from_slice(&52u16.to_ne_bytes());
    elf[42..44].copy_from_slice(&32u16.to_ne_bytes());
    elf[44..46].copy_from_slice(&(phdrs.len() as u16).to_ne_bytes());

    for ph in phdrs {
        for field in ph {
            elf.extend_from_slice(&field.to_ne_bytes());
        }
    }
    elf.extend_from_slice(payload);
    elf
}

/// Offset of the payload in an image built by `create_elf`.
pub fn payload_offset(phnum: usize) -> u32 {
    (52 + phnum * 32) as u32
}

/// Arguments of one mapping call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapCall {
    pub vaddr: u32,
    pub mem_size: u32,
    pub data: Vec<u8>,
    pub file_size: u32,
}

/// Test double recording every call, optionally failing on the n-th (1-based).
#[derive(Debug, Default)]
pub struct RecordingMapper {
    pub calls: Vec<MapCall>,
    pub fail_on: Option<usize>,
}

impl RecordingMapper {
    pub fn failing_on(call: usize) -> Self {
        Self {
            calls: Vec::new(),
            fail_on: Some(call),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFailure {
    pub call: usize,
}

impl MapSegment for RecordingMapper {
    type Error = MapFailure;

    fn map_segment(&mut self, segment: &Segment<'_>) -> Result<(), MapFailure> {
        self.calls.push(MapCall {
            vaddr: segment.vaddr,
            mem_size: segment.mem_size,
            data: segment.data.to_vec(),
            file_size: segment.file_size,
        });
        if self.fail_on == Some(self.calls.len()) {
            return Err(MapFailure {
                call: self.calls.len(),
            });
        }
        Ok(())
    }
}
