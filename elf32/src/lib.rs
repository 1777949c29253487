//! ELF32 Segment Loader
//!
//! Maps the loadable segments of a 32-bit ELF executable through a
//! caller-supplied mapping collaborator and reports the entry point.
//!
//! # Supported Input
//!
//! - ELF32 header parsing
//! - Program header table (PT_LOAD segments only)
//! - Native, little or big endian field decoding
//!
//! # Safety
//!
//! - Every header and table access is bounds-checked against the image
//! - The whole program header table is validated before the first mapping
//! - The loader never allocates, copies or retains the image

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod elf;
pub mod mapper;
pub mod segment_loader;

pub use config::{ByteOrder, LoaderConfig};
pub use elf::{is_elf, ElfError, ElfHeader, ElfImage, ProgramHeader, Segment, SegmentFlags};
pub use mapper::{FlatMapError, FlatMemoryMapper, MapSegment, SharedMapper};
pub use segment_loader::{load, Elf32Loader, LoadError};
