//! ELF Segment Loader
//!
//! Connects the ELF parser (`elf.rs`) to a mapping collaborator
//! (`mapper.rs`): every PT_LOAD segment is handed to the collaborator in
//! program header order, then the entry point is returned.
//!
//! # Process
//!
//! 1. Check the magic and parse the ELF32 header
//! 2. Validate the program header table and every loadable segment range
//! 3. For each PT_LOAD entry, call `MapSegment::map_segment`
//!    a. A collaborator error stops the load immediately
//!    b. Already mapped segments are left to the caller
//! 4. Return `e_entry`

use core::fmt;

use crate::config::LoaderConfig;
use crate::elf::{ElfError, ElfImage};
use crate::mapper::MapSegment;

/// Errors that can occur while loading an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError<E> {
    /// The image was rejected before any segment was mapped
    Format(ElfError),
    /// The mapping collaborator failed
    MappingFailed(E),
}

impl<E> From<ElfError> for LoadError<E> {
    fn from(err: ElfError) -> Self {
        Self::Format(err)
    }
}

impl<E: fmt::Display> fmt::Display for LoadError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(err) => write!(f, "Invalid ELF image: {}", err),
            Self::MappingFailed(err) => write!(f, "Segment mapping failed: {}", err),
        }
    }
}

/// ELF32 segment loader
#[derive(Debug, Clone, Copy, Default)]
pub struct Elf32Loader {
    config: LoaderConfig,
}

impl Elf32Loader {
    /// Create a loader with the given configuration
    pub const fn new(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Loader configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Map every loadable segment of `binary` through `mapper`.
    ///
    /// # Arguments
    ///
    /// * `binary` - Complete ELF image; its length is the image size
    /// * `mapper` - Collaborator called once per PT_LOAD segment, in order
    ///
    /// # Returns
    ///
    /// * `Ok(entry)` - All segments mapped; `entry` is `e_entry`
    /// * `Err(LoadError::Format)` - Image rejected, `mapper` never called
    /// * `Err(LoadError::MappingFailed)` - `mapper` failed; later segments skipped
    pub fn load<M: MapSegment>(
        &self,
        binary: &[u8],
        mapper: &mut M,
    ) -> Result<u32, LoadError<M::Error>> {
        let image = ElfImage::parse(binary, &self.config).map_err(|err| {
            log::warn!("[ELF] rejected image ({} bytes): {}", binary.len(), err);
            err
        })?;

        image.validate().map_err(|err| {
            log::warn!("[ELF] rejected image: {}", err);
            err
        })?;

        for ph in image.program_headers() {
            let ph = ph?;

            if !ph.is_loadable() {
                log::trace!("[ELF] skipping program header {} (type {:#x})", ph.index, ph.p_type);
                continue;
            }

            let segment = image.segment(&ph)?;

            log::debug!(
                "[ELF] mapping segment {}: vaddr={:#x} memsz={:#x} filesz={:#x}",
                segment.index,
                segment.vaddr,
                segment.mem_size,
                segment.file_size
            );

            if let Err(err) = mapper.map_segment(&segment) {
                log::warn!("[ELF] mapping segment {} at {:#x} failed", segment.index, segment.vaddr);
                return Err(LoadError::MappingFailed(err));
            }
        }

        Ok(image.entry_point())
    }
}

/// Load `binary` with the default configuration.
///
/// See [`Elf32Loader::load`].
pub fn load<M: MapSegment>(binary: &[u8], mapper: &mut M) -> Result<u32, LoadError<M::Error>> {
    Elf32Loader::default().load(binary, mapper)
}
