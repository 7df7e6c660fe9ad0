//! Width- and endianness-agnostic access to ELF files

mod reader;
mod types;

pub use reader::ElfImage;
pub use types::*;
