//! KPIO ELF32 Fuzzing Infrastructure
//!
//! Mutation fuzzing for the ELF32 loader. Targets check loader invariants
//! on arbitrary input instead of relying on a crash alone.

#![cfg_attr(not(test), no_std)]
extern crate alloc;

pub mod elf;
pub mod harness;

use alloc::string::String;
use alloc::vec::Vec;

/// Fuzzing target trait
pub trait FuzzTarget {
    /// Name of the fuzz target
    fn name(&self) -> &str;

    /// Run fuzzing iteration with input
    fn fuzz(&mut self, input: &[u8]) -> FuzzResult;

    /// Reset state between iterations
    fn reset(&mut self);
}

/// Result of a fuzz iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuzzResult {
    /// Input processed successfully
    Ok,
    /// Input rejected (expected for malformed input)
    ParseError(String),
    /// Invariant violated
    Crash(CrashInfo),
    /// Input reached new behaviour worth keeping in the corpus
    Interesting(String),
}

impl FuzzResult {
    /// Check if this is a crash
    pub fn is_crash(&self) -> bool {
        matches!(self, FuzzResult::Crash(_))
    }

    /// Check if this is interesting
    pub fn is_interesting(&self) -> bool {
        matches!(self, FuzzResult::Interesting(_) | FuzzResult::Crash(_))
    }
}

/// Crash information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashInfo {
    /// Crash type
    pub crash_type: CrashType,
    /// Offending address or offset (if applicable)
    pub address: Option<u64>,
    /// Human readable description
    pub message: String,
}

/// Type of crash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashType {
    /// Segment slice outside the input buffer
    OutOfBoundsRead,
    /// Collaborator called when it must not have been
    UnexpectedMapping,
    /// Two runs over the same input disagreed
    Nondeterministic,
    /// Result inconsistent with the input
    WrongResult,
}

/// Fuzzer configuration
#[derive(Debug, Clone)]
pub struct FuzzerConfig {
    /// Maximum input size
    pub max_input_size: usize,
    /// Maximum iterations
    pub max_iterations: u64,
    /// Mutator seed
    pub seed: u64,
    /// Maximum number of corpus entries
    pub max_corpus: usize,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            max_input_size: 64 * 1024, // 64KB
            max_iterations: 10_000,
            seed: 12345,
            max_corpus: 1024,
        }
    }
}

/// Fuzzing statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzStats {
    /// Total iterations
    pub iterations: u64,
    /// Inputs accepted by the loader
    pub accepted: u64,
    /// Inputs rejected by the loader
    pub rejected: u64,
    /// Crashes found
    pub crashes: u64,
    /// Unique crashes
    pub unique_crashes: u64,
    /// Corpus size
    pub corpus_size: usize,
}

/// Offsets of the ELF32 header fields worth corrupting
const HEADER_FIELDS: &[(usize, usize)] = &[
    (24, 4), // e_entry
    (28, 4), // e_phoff
    (42, 2), // e_phentsize
    (44, 2), // e_phnum
];

/// Boundary values for header and program header fields
const INTERESTING_U32: &[u32] = &[0, 1, 0x20, 0x34, 0x7F, 0xFF, 0xFFFF, 0x8000_0000, 0xFFFF_FFF0, u32::MAX];

/// Mutator for input generation
pub struct Mutator {
    /// Current seed
    seed: u64,
    /// Dictionary of interesting byte strings
    dictionary: Vec<Vec<u8>>,
}

impl Mutator {
    /// Create a new mutator
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            dictionary: Vec::new(),
        }
    }

    /// Add dictionary entry
    pub fn add_dictionary(&mut self, entry: Vec<u8>) {
        self.dictionary.push(entry);
    }

    /// Next pseudo-random value
    pub fn next_random(&mut self) -> u64 {
        self.seed = self.seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.seed >> 16
    }

    /// Mutate input
    pub fn mutate(&mut self, input: &mut Vec<u8>) {
        match self.next_random() % 8 {
            0 => self.bit_flip(input),
            1 => self.byte_replace(input),
            2 => self.truncate(input),
            3 => self.extend(input),
            4 => self.header_field(input),
            5 => self.program_header_field(input),
            6 => self.dictionary_insert(input),
            _ => self.havoc(input),
        }
    }

    fn pick(&mut self, len: usize) -> usize {
        (self.next_random() as usize) % len
    }

    fn interesting(&mut self) -> u32 {
        let idx = self.pick(INTERESTING_U32.len());
        INTERESTING_U32[idx]
    }

    fn bit_flip(&mut self, input: &mut Vec<u8>) {
        if input.is_empty() {
            return;
        }
        let pos = self.pick(input.len());
        let bit = (self.next_random() % 8) as u8;
        input[pos] ^= 1 << bit;
    }

    fn byte_replace(&mut self, input: &mut Vec<u8>) {
        if input.is_empty() {
            return;
        }
        let pos = self.pick(input.len());
        input[pos] = (self.next_random() & 0xFF) as u8;
    }

    fn truncate(&mut self, input: &mut Vec<u8>) {
        if input.is_empty() {
            return;
        }
        let len = self.pick(input.len());
        input.truncate(len);
    }

    fn extend(&mut self, input: &mut Vec<u8>) {
        let count = (self.next_random() % 64) as usize + 1;
        for _ in 0..count {
            let byte = (self.next_random() & 0xFF) as u8;
            input.push(byte);
        }
    }

    fn write_field(&mut self, input: &mut [u8], offset: usize, width: usize) {
        let value = self.interesting().to_ne_bytes();
        // narrower fields take the low-order bytes
        let low = if cfg!(target_endian = "big") {
            &value[value.len() - width..]
        } else {
            &value[..width]
        };
        if let Some(field) = input.get_mut(offset..offset + width) {
            field.copy_from_slice(low);
        }
    }

    fn header_field(&mut self, input: &mut Vec<u8>) {
        let (offset, width) = HEADER_FIELDS[self.pick(HEADER_FIELDS.len())];
        self.write_field(input, offset, width);
    }

    fn program_header_field(&mut self, input: &mut Vec<u8>) {
        // first few entries of a table placed right after the header
        let entry = self.pick(4);
        let field = self.pick(8);
        self.write_field(input, 52 + entry * 32 + field * 4, 4);
    }

    fn dictionary_insert(&mut self, input: &mut Vec<u8>) {
        if self.dictionary.is_empty() {
            return;
        }
        let dict_idx = self.pick(self.dictionary.len());
        let entry = self.dictionary[dict_idx].clone();
        let pos = if input.is_empty() { 0 } else { self.pick(input.len()) };
        for (i, &byte) in entry.iter().enumerate() {
            if pos + i < input.len() {
                input[pos + i] = byte;
            } else {
                input.push(byte);
            }
        }
    }

    fn havoc(&mut self, input: &mut Vec<u8>) {
        let iterations = (self.next_random() % 8) + 1;
        for _ in 0..iterations {
            match self.next_random() % 5 {
                0 => self.bit_flip(input),
                1 => self.byte_replace(input),
                2 => self.header_field(input),
                3 => self.program_header_field(input),
                _ => self.dictionary_insert(input),
            }
        }
    }
}

/// Corpus manager
pub struct Corpus {
    /// Input entries
    entries: Vec<Vec<u8>>,
    /// Maximum size
    max_size: usize,
}

impl Corpus {
    /// Create new corpus
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_size,
        }
    }

    /// Add entry unless full or already present
    pub fn add(&mut self, data: Vec<u8>) -> bool {
        if self.entries.len() >= self.max_size || self.entries.contains(&data) {
            return false;
        }
        self.entries.push(data);
        true
    }

    /// Pick an entry
    pub fn pick(&self, seed: u64) -> Option<&Vec<u8>> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = (seed as usize) % self.entries.len();
        Some(&self.entries[idx])
    }

    /// Get corpus size
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
