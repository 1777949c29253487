//! Segment Mapping Collaborators
//!
//! The loader only interprets the image. Placing segment bytes into an
//! address space is delegated to a [`MapSegment`] implementor, which carries
//! whatever context it needs (page tables, frame allocator, test recorder).
//!
//! # Contract
//!
//! For each segment the collaborator makes `vaddr..vaddr + mem_size`
//! available, copies `data` to `vaddr` and zero-fills the remaining
//! `bss_size()` bytes.

use core::fmt;

use crate::elf::Segment;

/// Mapping collaborator invoked once per PT_LOAD segment.
pub trait MapSegment {
    /// Collaborator failure, passed through the loader unchanged
    type Error;

    /// Map one segment.
    fn map_segment(&mut self, segment: &Segment<'_>) -> Result<(), Self::Error>;
}

impl<F, E> MapSegment for F
where
    F: FnMut(&Segment<'_>) -> Result<(), E>,
{
    type Error = E;

    fn map_segment(&mut self, segment: &Segment<'_>) -> Result<(), E> {
        self(segment)
    }
}

/// Collaborator shared between loads through a spinlock.
///
/// The lock is held for one segment at a time, so loads of different
/// images on different CPUs interleave at segment granularity.
pub struct SharedMapper<'s, M> {
    inner: &'s spin::Mutex<M>,
}

impl<'s, M: MapSegment> SharedMapper<'s, M> {
    /// Wrap a locked collaborator
    pub fn new(inner: &'s spin::Mutex<M>) -> Self {
        Self { inner }
    }
}

impl<M: MapSegment> MapSegment for SharedMapper<'_, M> {
    type Error = M::Error;

    fn map_segment(&mut self, segment: &Segment<'_>) -> Result<(), Self::Error> {
        self.inner.lock().map_segment(segment)
    }
}

/// Errors from [`FlatMemoryMapper`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatMapError {
    /// Segment does not fit inside the memory window
    OutOfRange {
        /// Segment virtual address
        vaddr: u32,
        /// Segment size in memory
        mem_size: u32,
    },
    /// File size larger than memory size
    FileSizeExceedsMemSize {
        /// Program header index
        index: usize,
    },
    /// Segment is both writable and executable
    WriteExecute {
        /// Program header index
        index: usize,
    },
}

impl fmt::Display for FlatMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { vaddr, mem_size } => {
                write!(f, "Segment {:#x}+{:#x} outside memory window", vaddr, mem_size)
            }
            Self::FileSizeExceedsMemSize { index } => {
                write!(f, "Segment {} file size exceeds memory size", index)
            }
            Self::WriteExecute { index } => {
                write!(f, "Segment {} is both writable and executable", index)
            }
        }
    }
}

/// Page size used for the break computation
pub const PAGE_SIZE: u64 = 4096;

/// Copies segments into a caller-provided window of identity-mapped memory.
///
/// `window[0]` corresponds to virtual address `base`. Suitable for boot
/// stages that run with physical == virtual addressing.
pub struct FlatMemoryMapper<'m> {
    window: &'m mut [u8],
    base: u32,
    enforce_wx: bool,
    mapped_segments: usize,
    highest_address: u64,
}

impl<'m> FlatMemoryMapper<'m> {
    /// Create a mapper over `window`, which starts at virtual `base`.
    pub fn new(window: &'m mut [u8], base: u32) -> Self {
        Self {
            window,
            base,
            enforce_wx: false,
            mapped_segments: 0,
            highest_address: 0,
        }
    }

    /// Reject segments that are both writable and executable
    pub fn enforce_wx(mut self, enforce: bool) -> Self {
        self.enforce_wx = enforce;
        self
    }

    /// Number of segments mapped so far
    pub fn mapped_segments(&self) -> usize {
        self.mapped_segments
    }

    /// First page boundary after every mapped segment (initial heap break)
    pub fn highest_address(&self) -> u64 {
        (self.highest_address + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }

    fn window_range(&self, segment: &Segment<'_>) -> Option<(usize, usize)> {
        let start = segment.vaddr.checked_sub(self.base)? as usize;
        let end = start.checked_add(segment.mem_size as usize)?;
        if end > self.window.len() {
            return None;
        }
        Some((start, end))
    }
}

impl MapSegment for FlatMemoryMapper<'_> {
    type Error = FlatMapError;

    fn map_segment(&mut self, segment: &Segment<'_>) -> Result<(), FlatMapError> {
        if segment.file_size > segment.mem_size || segment.data.len() > segment.mem_size as usize
        {
            return Err(FlatMapError::FileSizeExceedsMemSize {
                index: segment.index,
            });
        }

        if self.enforce_wx && segment.is_writable() && segment.is_executable() {
            log::warn!(
                "[ELF] W^X violation - segment at {:#x} has W+X",
                segment.vaddr
            );
            return Err(FlatMapError::WriteExecute {
                index: segment.index,
            });
        }

        let (start, end) = self.window_range(segment).ok_or(FlatMapError::OutOfRange {
            vaddr: segment.vaddr,
            mem_size: segment.mem_size,
        })?;

        let copy_end = start + segment.data.len();
        self.window[start..copy_end].copy_from_slice(segment.data);
        // BSS
        self.window[copy_end..end].fill(0);

        self.mapped_segments += 1;
        if segment.end() > self.highest_address {
            self.highest_address = segment.end();
        }

        log::trace!(
            "[ELF] copied {:#x} bytes to {:#x}, zeroed {:#x}",
            segment.data.len(),
            segment.vaddr,
            end - copy_end
        );

        Ok(())
    }
}
