//! ELF32 Loader Fuzzing
//!
//! Runs the loader against arbitrary bytes with a recording collaborator and
//! reports any broken loader invariant as a crash.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use kpio_elf32::{load, LoadError, MapSegment, Segment};

use crate::{CrashInfo, CrashType, FuzzResult, FuzzTarget};

/// One recorded collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    index: usize,
    vaddr: u32,
    mem_size: u32,
    file_size: u32,
    /// Start of `data` relative to the input, `None` if outside it
    offset: Option<usize>,
    data_len: usize,
}

/// Collaborator that records calls and can fail on a chosen call
struct RecordingMapper<'i> {
    input: &'i [u8],
    calls: Vec<Mapping>,
    fail_on: Option<usize>,
}

impl<'i> RecordingMapper<'i> {
    fn new(input: &'i [u8], fail_on: Option<usize>) -> Self {
        Self {
            input,
            calls: Vec::new(),
            fail_on,
        }
    }

    fn offset_of(&self, data: &[u8]) -> Option<usize> {
        let start = self.input.as_ptr() as usize;
        let end = start + self.input.len();
        let data_start = data.as_ptr() as usize;
        if data.is_empty() {
            // empty slices may dangle anywhere
            return Some(0);
        }
        if data_start >= start && data_start + data.len() <= end {
            Some(data_start - start)
        } else {
            None
        }
    }
}

impl MapSegment for RecordingMapper<'_> {
    type Error = usize;

    fn map_segment(&mut self, segment: &Segment<'_>) -> Result<(), usize> {
        let offset = self.offset_of(segment.data);
        self.calls.push(Mapping {
            index: segment.index,
            vaddr: segment.vaddr,
            mem_size: segment.mem_size,
            file_size: segment.file_size,
            offset,
            data_len: segment.data.len(),
        });

        if self.fail_on == Some(self.calls.len()) {
            return Err(self.calls.len());
        }
        Ok(())
    }
}

type Outcome = (Result<u32, LoadError<usize>>, Vec<Mapping>);

/// ELF32 loader fuzzer
pub struct ElfLoaderFuzzer {
    /// Fail the collaborator on this call (1-based)
    fail_on: Option<usize>,
    /// Inputs that mapped at least one segment
    accepted: u64,
}

impl ElfLoaderFuzzer {
    /// Create new loader fuzzer
    pub fn new() -> Self {
        Self {
            fail_on: None,
            accepted: 0,
        }
    }

    /// Make the collaborator fail on the given call
    pub fn fail_on(mut self, call: usize) -> Self {
        self.fail_on = Some(call);
        self
    }

    /// Inputs that mapped at least one segment so far
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    fn run(&self, input: &[u8]) -> Outcome {
        let mut mapper = RecordingMapper::new(input, self.fail_on);
        let result = load(input, &mut mapper);
        (result, mapper.calls)
    }

    /// Check one outcome against the loader contract
    fn check(&self, input: &[u8], outcome: &Outcome) -> Result<(), CrashInfo> {
        let (result, calls) = outcome;

        for call in calls {
            let offset = call.offset.ok_or_else(|| {
                crash(
                    CrashType::OutOfBoundsRead,
                    Some(u64::from(call.vaddr)),
                    format!("segment {} data outside input", call.index),
                )
            })?;
            if call.data_len != call.file_size as usize {
                return Err(crash(
                    CrashType::WrongResult,
                    Some(offset as u64),
                    format!("segment {} data length != p_filesz", call.index),
                ));
            }
        }

        if calls.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(crash(
                CrashType::UnexpectedMapping,
                None,
                String::from("segments mapped out of table order"),
            ));
        }

        let phnum = phnum_of(input);
        if calls.len() > phnum {
            return Err(crash(
                CrashType::UnexpectedMapping,
                None,
                format!("{} mappings for {} program headers", calls.len(), phnum),
            ));
        }

        match result {
            Err(LoadError::Format(err)) if !calls.is_empty() => Err(crash(
                CrashType::UnexpectedMapping,
                None,
                format!("mapped {} segments before rejecting: {}", calls.len(), err),
            )),
            Err(LoadError::MappingFailed(call)) if Some(*call) != self.fail_on || *call != calls.len() => {
                Err(crash(
                    CrashType::UnexpectedMapping,
                    None,
                    format!("iteration continued after failed call {}", call),
                ))
            }
            Ok(_) if input.len() < 52 => Err(crash(
                CrashType::WrongResult,
                None,
                format!("accepted {}-byte input", input.len()),
            )),
            Ok(entry) if Some(*entry) != entry_of(input) => Err(crash(
                CrashType::WrongResult,
                None,
                String::from("entry point differs from e_entry"),
            )),
            _ => Ok(()),
        }
    }
}

impl Default for ElfLoaderFuzzer {
    fn default() -> Self {
        Self::new()
    }
}

impl FuzzTarget for ElfLoaderFuzzer {
    fn name(&self) -> &str {
        "elf32_loader"
    }

    fn fuzz(&mut self, input: &[u8]) -> FuzzResult {
        let first = self.run(input);
        if let Err(info) = self.check(input, &first) {
            return FuzzResult::Crash(info);
        }

        let second = self.run(input);
        if first != second {
            return FuzzResult::Crash(crash(
                CrashType::Nondeterministic,
                None,
                String::from("second load disagreed with the first"),
            ));
        }

        match first {
            (Ok(_), calls) if !calls.is_empty() => {
                self.accepted += 1;
                FuzzResult::Interesting(format!("{} segments", calls.len()))
            }
            (Ok(_), _) => FuzzResult::Ok,
            (Err(err), _) => FuzzResult::ParseError(format!("{:?}", err)),
        }
    }

    fn reset(&mut self) {
        // No per-input state
    }
}

fn crash(crash_type: CrashType, address: Option<u64>, message: String) -> CrashInfo {
    CrashInfo {
        crash_type,
        address,
        message,
    }
}

fn phnum_of(input: &[u8]) -> usize {
    input
        .get(44..46)
        .and_then(|b| b.try_into().ok())
        .map(|b: [u8; 2]| u16::from_ne_bytes(b) as usize)
        .unwrap_or(0)
}

fn entry_of(input: &[u8]) -> Option<u32> {
    input
        .get(24..28)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
}

/// Byte strings the mutator splices into inputs
pub fn elf_dictionary() -> Vec<Vec<u8>> {
    let mut dict = Vec::new();
    dict.push(alloc::vec![0x7F, b'E', b'L', b'F']);
    dict.push(alloc::vec![0x7F, b'E', b'L', b'F', 1, 1, 1]);
    for value in [1u32, 6, 0x34, 0x1000, 0xFFFF_FFFF] {
        dict.push(value.to_ne_bytes().to_vec());
    }
    for value in [32u16, 0, 0xFFFF] {
        dict.push(value.to_ne_bytes().to_vec());
    }
    dict
}

/// Host-endian ELF32 image with the given program headers and payload
pub fn build_elf(entry: u32, phdrs: &[[u32; 8]], payload: &[u8]) -> Vec<u8> {
    let mut elf = alloc::vec![0u8; 52];
    elf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
    elf[4] = 1;
    elf[5] = if cfg!(target_endian = "big") { 2 } else { 1 };
    elf[6] = 1;
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

/// Seed corpus of well-formed and borderline images
pub fn elf_seed_corpus() -> Vec<Vec<u8>> {
    const PT_LOAD: u32 = 1;
    const PT_NOTE: u32 = 4;

    let mut corpus = Vec::new();
    corpus.push(build_elf(0x0010_0020, &[], &[]));
    corpus.push(build_elf(
        0x0040_0000,
        &[[PT_LOAD, 84, 0x0040_0000, 0, 8, 0x1000, 5, 0x1000]],
        &[0x90; 8],
    ));
    corpus.push(build_elf(
        0x0040_0000,
        &[
            [PT_NOTE, 148, 0, 0, 4, 4, 4, 4],
            [PT_LOAD, 148, 0x0040_0000, 0, 4, 4, 5, 0x1000],
            [PT_LOAD, 152, 0x1000_0000, 0, 4, 0x2000, 6, 0x1000],
        ],
        &[1, 2, 3, 4, 5, 6, 7, 8],
    ));
    corpus.push(alloc::vec![0x7F, b'E', b'L', b'F']);
    corpus
}
