//! ELF code-object reader
//!
//! Parses device code objects and host program images just far enough for
//! loading: section headers, symbol tables with their linked string tables,
//! and the byte extent an image occupies.
//!
//! ```text
//! ┌──────────────┐   ElfImage::parse   ┌────────────────────────────┐
//! │  &[u8] image │ ──────────────────▶ │ header + section headers   │
//! └──────────────┘                     │  ├─ symbol_table()  SYMTAB │
//!                                      │  ├─ dynamic_symbols() DYN  │
//!                                      │  └─ extent()               │
//!                                      └────────────────────────────┘
//! ```

mod image;
mod symbols;

pub use image::{ElfImage, SectionInfo, EV_CURRENT};
pub use symbols::{ElfSymbol, SymbolTable, SymbolType};

/// Errors raised while reading an object file
#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    /// Header, section or symbol table could not be decoded
    #[error("object could not be decoded: {0}")]
    Decode(#[from] goblin::error::Error),

    /// The object's version marker is not `EV_CURRENT`
    #[error("unsupported object version {0} (expected {EV_CURRENT})")]
    UnsupportedVersion(u32),

    /// A table or section runs past the end of the image
    #[error("{what} at offset {offset:#x} with size {size:#x} exceeds image length {len:#x}")]
    Truncated {
        what: &'static str,
        offset: u64,
        size: u64,
        len: usize,
    },

    /// Section header entries have an unexpected size
    #[error("section header entry size {found} does not match expected {expected}")]
    BadSectionEntrySize { found: u16, expected: u16 },

    /// Symbol table entries have an unexpected size
    #[error("symbol table in section {section} has entry size {found}, expected {expected}")]
    BadSymbolEntrySize { section: usize, found: u64, expected: u64 },

    /// A section links to a section index that does not exist
    #[error("section {section} links to missing section {link}")]
    InvalidLink { section: usize, link: u32 },
}
