//! Fuzzing Harness
//!
//! Main fuzzing loop, crash de-duplication and crash minimization.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::HashSet;

use crate::{Corpus, CrashInfo, CrashType, FuzzResult, FuzzStats, FuzzTarget, FuzzerConfig, Mutator};

/// Main fuzzer harness
pub struct FuzzHarness {
    /// Configuration
    config: FuzzerConfig,
    /// Fuzz targets
    targets: Vec<Box<dyn FuzzTarget>>,
    /// Mutator
    mutator: Mutator,
    /// Corpus
    corpus: Corpus,
    /// Statistics
    stats: FuzzStats,
    /// Hashes of crashes already recorded
    seen: HashSet<u64>,
    /// Found crashes
    crashes: Vec<CrashEntry>,
}

/// A crash entry
#[derive(Debug, Clone)]
pub struct CrashEntry {
    /// Input that caused crash
    pub input: Vec<u8>,
    /// Crash info
    pub info: CrashInfo,
    /// Target name
    pub target: String,
    /// Hash for deduplication
    pub hash: u64,
}

impl FuzzHarness {
    /// Create new harness
    pub fn new(config: FuzzerConfig) -> Self {
        Self {
            mutator: Mutator::new(config.seed),
            corpus: Corpus::new(config.max_corpus),
            config,
            targets: Vec::new(),
            stats: FuzzStats::default(),
            seen: HashSet::new(),
            crashes: Vec::new(),
        }
    }

    /// Add fuzz target
    pub fn add_target(&mut self, target: Box<dyn FuzzTarget>) {
        self.targets.push(target);
    }

    /// Add corpus entry
    pub fn add_corpus(&mut self, data: Vec<u8>) {
        if self.corpus.add(data) {
            self.stats.corpus_size = self.corpus.len();
        }
    }

    /// Add dictionary entries
    pub fn add_dictionary(&mut self, entries: Vec<Vec<u8>>) {
        for entry in entries {
            self.mutator.add_dictionary(entry);
        }
    }

    /// Run fuzzing loop
    pub fn run(&mut self, iterations: u64) -> FuzzReport {
        let iterations = iterations.min(self.config.max_iterations);
        for _ in 0..iterations {
            self.fuzz_iteration();
        }

        FuzzReport {
            stats: self.stats.clone(),
            crashes: self.crashes.clone(),
        }
    }

    /// Run a single input through every target
    pub fn execute(&mut self, input: &[u8]) {
        let mut interesting = false;
        let mut crashes: Vec<(CrashInfo, String)> = Vec::new();

        for target in &mut self.targets {
            match target.fuzz(input) {
                FuzzResult::Crash(info) => crashes.push((info, String::from(target.name()))),
                FuzzResult::Interesting(_) => {
                    self.stats.accepted += 1;
                    interesting = true;
                }
                FuzzResult::Ok => self.stats.accepted += 1,
                FuzzResult::ParseError(_) => self.stats.rejected += 1,
            }
            target.reset();
        }

        for (info, name) in crashes {
            self.handle_crash(input, info, name);
        }

        if interesting {
            self.add_corpus(input.to_vec());
        }
    }

    fn fuzz_iteration(&mut self) {
        self.stats.iterations += 1;

        let pick = self.mutator.next_random();
        let mut input = self.corpus.pick(pick).cloned().unwrap_or_default();
        self.mutator.mutate(&mut input);
        input.truncate(self.config.max_input_size);

        self.execute(&input);
    }

    fn handle_crash(&mut self, input: &[u8], info: CrashInfo, target: String) {
        let hash = hash_crash(&info);
        self.stats.crashes += 1;

        if self.seen.insert(hash) {
            log::warn!("[FUZZ] {}: {:?} - {}", target, info.crash_type, info.message);
            self.stats.unique_crashes += 1;
            self.crashes.push(CrashEntry {
                input: input.to_vec(),
                info,
                target,
                hash,
            });
        }
    }

    /// Get current statistics
    pub fn stats(&self) -> &FuzzStats {
        &self.stats
    }

    /// Get found crashes
    pub fn crashes(&self) -> &[CrashEntry] {
        &self.crashes
    }
}

/// Hash based on crash type and message
fn hash_crash(info: &CrashInfo) -> u64 {
    let mut hash: u64 = match info.crash_type {
        CrashType::OutOfBoundsRead => 1,
        CrashType::UnexpectedMapping => 2,
        CrashType::Nondeterministic => 3,
        CrashType::WrongResult => 4,
    };

    // FNV-1a over the message, digits skipped so counts do not split buckets
    for byte in info.message.bytes().filter(|b| !b.is_ascii_digit()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }

    hash
}

/// Fuzzing report
#[derive(Debug, Clone)]
pub struct FuzzReport {
    /// Statistics
    pub stats: FuzzStats,
    /// Crashes found
    pub crashes: Vec<CrashEntry>,
}

impl FuzzReport {
    /// Format as text
    pub fn format(&self) -> String {
        let mut output = String::new();

        output.push_str("=== Fuzzing Report ===\n\n");
        output.push_str(&format!("  Iterations: {}\n", self.stats.iterations));
        output.push_str(&format!(
            "  Accepted/Rejected: {}/{}\n",
            self.stats.accepted, self.stats.rejected
        ));
        output.push_str(&format!(
            "  Crashes: {} ({} unique)\n",
            self.stats.crashes, self.stats.unique_crashes
        ));
        output.push_str(&format!("  Corpus: {}\n", self.stats.corpus_size));

        if !self.crashes.is_empty() {
            output.push_str("\nCrashes:\n");
            for crash in &self.crashes {
                output.push_str(&format!(
                    "  - {:?} in {}: {} ({} byte input)\n",
                    crash.info.crash_type,
                    crash.target,
                    crash.info.message,
                    crash.input.len()
                ));
            }
        }

        output
    }
}

/// Crash minimizer
pub struct CrashMinimizer<'a> {
    /// Target to reproduce crash
    target: &'a mut dyn FuzzTarget,
}

impl<'a> CrashMinimizer<'a> {
    /// Create new minimizer
    pub fn new(target: &'a mut dyn FuzzTarget) -> Self {
        Self { target }
    }

    /// Shrink a crashing input while it keeps crashing
    pub fn minimize(&mut self, input: Vec<u8>) -> Vec<u8> {
        let mut current = input;
        let mut improved = true;

        while improved {
            improved = false;

            for chunk_size in [32, 16, 8, 4, 2, 1] {
                let result = self.try_remove_chunks(&current, chunk_size);
                if result.len() < current.len() {
                    current = result;
                    improved = true;
                    break;
                }
            }
        }

        self.zero_bytes(current)
    }

    fn try_remove_chunks(&mut self, input: &[u8], chunk_size: usize) -> Vec<u8> {
        for start in (0..input.len()).step_by(chunk_size) {
            let end = (start + chunk_size).min(input.len());

            let mut candidate = Vec::with_capacity(input.len());
            candidate.extend_from_slice(&input[..start]);
            candidate.extend_from_slice(&input[end..]);

            if self.still_crashes(&candidate) {
                return candidate;
            }
        }

        input.to_vec()
    }

    fn zero_bytes(&mut self, mut input: Vec<u8>) -> Vec<u8> {
        for i in 0..input.len() {
            if input[i] != 0 {
                let original = input[i];
                input[i] = 0;

                if !self.still_crashes(&input) {
                    input[i] = original;
                }
            }
        }

        input
    }

    fn still_crashes(&mut self, input: &[u8]) -> bool {
        self.target.reset();
        self.target.fuzz(input).is_crash()
    }
}

/// Run a quick fuzz campaign and report whether any crash was found
pub fn quick_fuzz<T: FuzzTarget>(mut target: T, corpus: Vec<Vec<u8>>, iterations: u64) -> bool {
    let mut mutator = Mutator::new(42);
    let mut current_corpus = corpus;

    for _ in 0..iterations {
        let mut input = if current_corpus.is_empty() {
            Vec::new()
        } else {
            let idx = mutator.next_random() as usize % current_corpus.len();
            current_corpus[idx].clone()
        };

        mutator.mutate(&mut input);

        let result = target.fuzz(&input);
        target.reset();

        if result.is_crash() {
            return true;
        }
        if result.is_interesting() {
            current_corpus.push(input);
        }
    }

    false
}
