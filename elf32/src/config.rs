//! Loader configuration.
//!
//! The defaults reproduce the classic kernel loader: only the magic is
//! checked and fields are read in host byte order.

/// How multi-byte header fields are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Host byte order, no swapping
    #[default]
    Native,
    /// Little endian
    Little,
    /// Big endian
    Big,
    /// Taken from `e_ident[EI_DATA]`
    FromIdent,
}

/// Loader configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Field decoding
    pub byte_order: ByteOrder,
    /// Require ELFCLASS32 and ident version 1
    pub strict_ident: bool,
    /// Reject loadable segments whose file size exceeds their memory size
    pub check_mem_size: bool,
}

impl LoaderConfig {
    /// Configuration that trusts the ident bytes and checks them.
    pub const fn strict() -> Self {
        Self {
            byte_order: ByteOrder::FromIdent,
            strict_ident: true,
            check_mem_size: true,
        }
    }

    /// Set byte order
    pub const fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::Native,
            strict_ident: false,
            check_mem_size: false,
        }
    }
}
