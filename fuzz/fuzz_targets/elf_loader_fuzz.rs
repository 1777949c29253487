//! ELF32 Loader Fuzzing Target
//!
//! Run with: cargo fuzz run elf_loader_fuzz --features libfuzzer

#![no_main]

use kpio_elf32_fuzz::elf::ElfLoaderFuzzer;
use kpio_elf32_fuzz::{FuzzResult, FuzzTarget};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Skip oversized inputs; the loader cost is linear in e_phnum anyway
    if data.len() > 64 * 1024 {
        return;
    }

    for fail_on in [None, Some(1), Some(2)] {
        let mut target = match fail_on {
            Some(call) => ElfLoaderFuzzer::new().fail_on(call),
            None => ElfLoaderFuzzer::new(),
        };

        if let FuzzResult::Crash(info) = target.fuzz(data) {
            panic!("{:?}: {}", info.crash_type, info.message);
        }
    }
});
