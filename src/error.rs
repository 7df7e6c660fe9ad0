//! Error types for editelf

use std::fmt;

use thiserror::Error;

/// Main error type for ELF image operations
#[derive(Error, Debug)]
pub enum ElfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an ELF file: {0}")]
    NotAnElf(String),

    #[error("program header entry size was read as {found}, not {expected}")]
    MalformedHeader { expected: u16, found: u16 },

    #[error("no segment of type {0:#x} found")]
    SegmentNotFound(u32),

    #[error("segment of type {0:#x} has zero length")]
    ZeroLengthSegment(u32),

    #[error("no section of type {0:#x} found")]
    SectionNotFound(u32),

    #[error("section of type {0:#x} has zero length")]
    ZeroLengthSection(u32),
}

/// Errors related to the shared-library cache
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the cache's magic number doesn't compute")]
    InvalidFormat,
}

/// The dynamic-table property a warning refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    Needed,
    Soname,
    RuntimePath,
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Property::Needed => f.write_str("needed library"),
            Property::Soname => f.write_str("soname"),
            Property::RuntimePath => f.write_str("run-time path"),
        }
    }
}

/// Non-fatal conditions accumulated while editing
///
/// These never abort the run; the affected mutation is skipped and the rest
/// of the plan is carried out.
#[derive(Error, Debug)]
pub enum EditWarning {
    #[error("the new {property} {requested:?} is too big to fit ({available} bytes available)")]
    StringTooLarge {
        property: Property,
        requested: String,
        available: usize,
    },

    #[error("no entry was found to carry the {property}")]
    TargetNotFound { property: Property },

    #[error("the library name {name} was not found in the cache; you may want to run ldconfig")]
    LibraryNotInCache { name: String },

    #[error("failed to find a replacement for {name}")]
    NoReplacementFound { name: String },
}

/// Result of executing an edit plan
#[derive(Debug, Default)]
pub struct EditReport {
    /// Whether any byte of the file changed
    pub changed: bool,
    pub warnings: Vec<EditWarning>,
}

impl EditReport {
    /// True when every requested mutation was applied as asked
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
