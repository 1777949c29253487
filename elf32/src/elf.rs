//! ELF32 Parser
//!
//! Read-only, bounds-checked views over an ELF32 image. Nothing here copies
//! the image; every view borrows it for the duration of a load.

use core::fmt;

use crate::config::{ByteOrder, LoaderConfig};

/// ELF magic number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Index of the class byte in `e_ident`
pub const EI_CLASS: usize = 4;

/// Index of the data encoding byte in `e_ident`
pub const EI_DATA: usize = 5;

/// Index of the ident version byte in `e_ident`
pub const EI_VERSION: usize = 6;

/// ELF class: 32-bit
pub const ELFCLASS32: u8 = 1;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;

/// ELF data encoding: big endian
pub const ELFDATA2MSB: u8 = 2;

/// Current ELF version
pub const EV_CURRENT: u8 = 1;

/// Size of the ELF32 file header
pub const ELF32_EHDR_SIZE: usize = 52;

/// Size of an ELF32 program header
pub const ELF32_PHDR_SIZE: usize = 32;

/// Program header type: unused entry
pub const PT_NULL: u32 = 0;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;

/// Program header type: dynamic linking info
pub const PT_DYNAMIC: u32 = 2;

/// Program header type: interpreter path
pub const PT_INTERP: u32 = 3;

/// Program header type: auxiliary note
pub const PT_NOTE: u32 = 4;

/// Program header type: program header table
pub const PT_PHDR: u32 = 6;

/// Segment permission: executable
pub const PF_X: u32 = 1;

/// Segment permission: writable
pub const PF_W: u32 = 2;

/// Segment permission: readable
pub const PF_R: u32 = 4;

// ELF32 file header field offsets
const E_TYPE: usize = 16;
const E_MACHINE: usize = 18;
const E_VERSION: usize = 20;
const E_ENTRY: usize = 24;
const E_PHOFF: usize = 28;
const E_FLAGS: usize = 36;
const E_EHSIZE: usize = 40;
const E_PHENTSIZE: usize = 42;
const E_PHNUM: usize = 44;

// ELF32 program header field offsets
const P_TYPE: usize = 0;
const P_OFFSET: usize = 4;
const P_VADDR: usize = 8;
const P_PADDR: usize = 12;
const P_FILESZ: usize = 16;
const P_MEMSZ: usize = 20;
const P_FLAGS: usize = 24;
const P_ALIGN: usize = 28;

bitflags::bitflags! {
    /// Segment permissions from `p_flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        /// Executable
        const EXECUTE = PF_X;
        /// Writable
        const WRITE = PF_W;
        /// Readable
        const READ = PF_R;
    }
}

/// ELF parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Shorter than the magic or wrong magic number
    NotElf,
    /// Binary too small to contain the ELF32 header
    TruncatedHeader,
    /// Invalid ELF class (not 32-bit)
    InvalidClass,
    /// Invalid ident version
    InvalidVersion,
    /// Unknown data encoding in `e_ident`
    InvalidEncoding,
    /// Program header entries too small to hold a program header
    InvalidPhentsize,
    /// Program header table extends beyond the image
    ProgramHeaderTableOutOfBounds,
    /// Loadable segment data extends beyond the image
    SegmentOutOfBounds {
        /// Program header index
        index: usize,
    },
    /// Loadable segment has a file size larger than its memory size
    InvalidMemSize {
        /// Program header index
        index: usize,
    },
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotElf => write!(f, "Not an ELF image"),
            Self::TruncatedHeader => write!(f, "ELF header truncated"),
            Self::InvalidClass => write!(f, "Not a 32-bit ELF image"),
            Self::InvalidVersion => write!(f, "Unsupported ELF version"),
            Self::InvalidEncoding => write!(f, "Unknown ELF data encoding"),
            Self::InvalidPhentsize => write!(f, "Program header entry size too small"),
            Self::ProgramHeaderTableOutOfBounds => {
                write!(f, "Program header table out of bounds")
            }
            Self::SegmentOutOfBounds { index } => {
                write!(f, "Segment {} data out of bounds", index)
            }
            Self::InvalidMemSize { index } => {
                write!(f, "Segment {} file size exceeds memory size", index)
            }
        }
    }
}

/// Check whether `binary` starts with the ELF magic.
///
/// Slices shorter than the magic are never ELF.
pub fn is_elf(binary: &[u8]) -> bool {
    binary.len() >= ELF_MAGIC.len() && binary[..ELF_MAGIC.len()] == ELF_MAGIC
}

/// Byte order resolved for one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn resolve(order: ByteOrder, ident: &[u8; 16]) -> Result<Self, ElfError> {
        match order {
            ByteOrder::Native if cfg!(target_endian = "big") => Ok(Self::Big),
            ByteOrder::Native => Ok(Self::Little),
            ByteOrder::Little => Ok(Self::Little),
            ByteOrder::Big => Ok(Self::Big),
            ByteOrder::FromIdent => match ident[EI_DATA] {
                ELFDATA2LSB => Ok(Self::Little),
                ELFDATA2MSB => Ok(Self::Big),
                _ => Err(ElfError::InvalidEncoding),
            },
        }
    }

    fn read_u16(self, binary: &[u8], offset: usize) -> Option<u16> {
        let bytes: [u8; 2] = binary.get(offset..offset.checked_add(2)?)?.try_into().ok()?;
        Some(match self {
            Self::Little => u16::from_le_bytes(bytes),
            Self::Big => u16::from_be_bytes(bytes),
        })
    }

    fn read_u32(self, binary: &[u8], offset: usize) -> Option<u32> {
        let bytes: [u8; 4] = binary.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        })
    }
}

/// ELF32 file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ElfHeader {
    /// Magic number and other info
    pub ident: [u8; 16],
    /// Object file type
    pub e_type: u16,
    /// Machine type
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address
    pub e_entry: u32,
    /// Program header table file offset
    pub e_phoff: u32,
    /// Processor-specific flags
    pub e_flags: u32,
    /// ELF header size
    pub e_ehsize: u16,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
}

/// ELF32 program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ProgramHeader {
    /// Position in the program header table
    pub index: usize,
    /// Segment type
    pub p_type: u32,
    /// Segment file offset
    pub p_offset: u32,
    /// Segment virtual address
    pub p_vaddr: u32,
    /// Segment physical address (unused)
    pub p_paddr: u32,
    /// Segment size in file
    pub p_filesz: u32,
    /// Segment size in memory
    pub p_memsz: u32,
    /// Segment flags
    pub p_flags: u32,
    /// Segment alignment
    pub p_align: u32,
}

impl ProgramHeader {
    /// Check if this is a PT_LOAD entry
    pub fn is_loadable(&self) -> bool {
        self.p_type == PT_LOAD
    }
}

/// Loadable segment handed to the mapping collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct Segment<'a> {
    /// Position in the program header table
    pub index: usize,
    /// Virtual address where segment should be loaded
    pub vaddr: u32,
    /// Size of segment in memory
    pub mem_size: u32,
    /// Segment bytes from the image (`file_size` long)
    pub data: &'a [u8],
    /// Size of segment data in file
    pub file_size: u32,
    /// Segment permissions
    pub flags: SegmentFlags,
    /// Alignment requirement
    pub align: u32,
}

impl Segment<'_> {
    /// Number of trailing bytes the collaborator must zero-fill
    pub fn bss_size(&self) -> u32 {
        self.mem_size.saturating_sub(self.file_size)
    }

    /// First virtual address past the segment
    pub fn end(&self) -> u64 {
        u64::from(self.vaddr) + u64::from(self.mem_size)
    }

    /// Check if segment is readable
    pub fn is_readable(&self) -> bool {
        self.flags.contains(SegmentFlags::READ)
    }

    /// Check if segment is writable
    pub fn is_writable(&self) -> bool {
        self.flags.contains(SegmentFlags::WRITE)
    }

    /// Check if segment is executable
    pub fn is_executable(&self) -> bool {
        self.flags.contains(SegmentFlags::EXECUTE)
    }
}

/// A parsed ELF32 image borrowing its bytes
#[derive(Debug, Clone, Copy)]
pub struct ElfImage<'a> {
    binary: &'a [u8],
    header: ElfHeader,
    endian: Endian,
    config: LoaderConfig,
}

impl<'a> ElfImage<'a> {
    /// Parse the ELF32 header of `binary`
    ///
    /// # Returns
    ///
    /// * `Ok(ElfImage)` - Header fits and passes the configured ident checks
    /// * `Err(ElfError)` - Not ELF, truncated, or rejected ident
    pub fn parse(binary: &'a [u8], config: &LoaderConfig) -> Result<Self, ElfError> {
        if !is_elf(binary) {
            return Err(ElfError::NotElf);
        }

        if binary.len() < ELF32_EHDR_SIZE {
            return Err(ElfError::TruncatedHeader);
        }

        let mut ident = [0u8; 16];
        ident.copy_from_slice(&binary[..16]);

        if config.strict_ident {
            if ident[EI_CLASS] != ELFCLASS32 {
                return Err(ElfError::InvalidClass);
            }
            if ident[EI_VERSION] != EV_CURRENT {
                return Err(ElfError::InvalidVersion);
            }
        }

        let endian = Endian::resolve(config.byte_order, &ident)?;
        let header = Self::parse_header(binary, ident, endian).ok_or(ElfError::TruncatedHeader)?;

        log::debug!(
            "[ELF] entry={:#x} phoff={:#x} phnum={} phentsize={}",
            header.e_entry,
            header.e_phoff,
            header.e_phnum,
            header.e_phentsize
        );

        Ok(Self {
            binary,
            header,
            endian,
            config: *config,
        })
    }

    fn parse_header(binary: &[u8], ident: [u8; 16], endian: Endian) -> Option<ElfHeader> {
        Some(ElfHeader {
            ident,
            e_type: endian.read_u16(binary, E_TYPE)?,
            e_machine: endian.read_u16(binary, E_MACHINE)?,
            e_version: endian.read_u32(binary, E_VERSION)?,
            e_entry: endian.read_u32(binary, E_ENTRY)?,
            e_phoff: endian.read_u32(binary, E_PHOFF)?,
            e_flags: endian.read_u32(binary, E_FLAGS)?,
            e_ehsize: endian.read_u16(binary, E_EHSIZE)?,
            e_phentsize: endian.read_u16(binary, E_PHENTSIZE)?,
            e_phnum: endian.read_u16(binary, E_PHNUM)?,
        })
    }

    /// Parsed file header
    pub fn header(&self) -> &ElfHeader {
        &self.header
    }

    /// Program entry point
    pub fn entry_point(&self) -> u32 {
        self.header.e_entry
    }

    /// Check the program header table and every loadable segment range.
    ///
    /// Runs before any segment is mapped so that a malformed image is
    /// rejected as a whole.
    pub fn validate(&self) -> Result<(), ElfError> {
        let phnum = usize::from(self.header.e_phnum);
        if phnum == 0 {
            return Ok(());
        }

        let phentsize = usize::from(self.header.e_phentsize);
        if phentsize < ELF32_PHDR_SIZE {
            return Err(ElfError::InvalidPhentsize);
        }

        let table_end = (phnum as u64)
            .checked_mul(phentsize as u64)
            .and_then(|len| len.checked_add(u64::from(self.header.e_phoff)))
            .ok_or(ElfError::ProgramHeaderTableOutOfBounds)?;

        if table_end > self.binary.len() as u64 {
            return Err(ElfError::ProgramHeaderTableOutOfBounds);
        }

        for segment in self.loadable_segments() {
            segment?;
        }

        Ok(())
    }

    /// Iterate over the program header table in file order
    pub fn program_headers(&self) -> ProgramHeaders<'_, 'a> {
        ProgramHeaders {
            image: self,
            index: 0,
        }
    }

    /// Iterate over PT_LOAD segments in file order
    pub fn loadable_segments(&self) -> impl Iterator<Item = Result<Segment<'a>, ElfError>> + '_ {
        self.program_headers().filter_map(move |ph| match ph {
            Ok(ph) if ph.is_loadable() => Some(self.segment(&ph)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    }

    /// Build the segment descriptor for a program header
    pub fn segment(&self, ph: &ProgramHeader) -> Result<Segment<'a>, ElfError> {
        let start = ph.p_offset as usize;
        let end = u64::from(ph.p_offset) + u64::from(ph.p_filesz);

        if end > self.binary.len() as u64 {
            return Err(ElfError::SegmentOutOfBounds { index: ph.index });
        }

        if self.config.check_mem_size && ph.p_filesz > ph.p_memsz {
            return Err(ElfError::InvalidMemSize { index: ph.index });
        }

        let data = self
            .binary
            .get(start..end as usize)
            .ok_or(ElfError::SegmentOutOfBounds { index: ph.index })?;

        Ok(Segment {
            index: ph.index,
            vaddr: ph.p_vaddr,
            mem_size: ph.p_memsz,
            data,
            file_size: ph.p_filesz,
            flags: SegmentFlags::from_bits_truncate(ph.p_flags),
            align: ph.p_align,
        })
    }

    fn read_program_header(&self, index: usize) -> Option<ProgramHeader> {
        let offset = (self.header.e_phoff as usize)
            .checked_add(index.checked_mul(usize::from(self.header.e_phentsize))?)?;

        if offset.checked_add(ELF32_PHDR_SIZE)? > self.binary.len() {
            return None;
        }

        let read = |field: usize| self.endian.read_u32(self.binary, offset + field);

        Some(ProgramHeader {
            index,
            p_type: read(P_TYPE)?,
            p_offset: read(P_OFFSET)?,
            p_vaddr: read(P_VADDR)?,
            p_paddr: read(P_PADDR)?,
            p_filesz: read(P_FILESZ)?,
            p_memsz: read(P_MEMSZ)?,
            p_flags: read(P_FLAGS)?,
            p_align: read(P_ALIGN)?,
        })
    }
}

/// Iterator over program headers, advancing by `e_phentsize`
pub struct ProgramHeaders<'i, 'a> {
    image: &'i ElfImage<'a>,
    index: usize,
}

impl Iterator for ProgramHeaders<'_, '_> {
    type Item = Result<ProgramHeader, ElfError>;

    fn next(&mut self) -> Option<Self::Item> {
        let phnum = usize::from(self.image.header.e_phnum);
        if self.index >= phnum {
            return None;
        }

        let index = self.index;
        match self.image.read_program_header(index) {
            Some(ph) => {
                self.index += 1;
                Some(Ok(ph))
            }
            None => {
                self.index = phnum;
                Some(Err(ElfError::ProgramHeaderTableOutOfBounds))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::from(self.image.header.e_phnum).saturating_sub(self.index);
        (0, Some(remaining))
    }
}
