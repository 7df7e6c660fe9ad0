//! Types for dynamic-table requests and state

use crate::image::ElfImage;
use crate::image::Segment;

/// Requested normalization of the run-time path priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Leave whichever tag kind the file already has
    #[default]
    Unchanged,
    /// Normalize to DT_RUNPATH: system libraries are searched first
    PreferRunpath,
    /// Normalize to DT_RPATH: the embedded path is searched first
    PreferRpath,
}

/// Requested change to a single-string property (SONAME or run-time path)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyAction {
    Set(String),
    Remove,
}

/// Which dynamic tag carries a run-time search path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePathKind {
    Rpath,
    Runpath,
}

/// A run-time search path read from an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePath {
    pub kind: RuntimePathKind,
    pub path: String,
}

/// Accumulated mutation requests, executed once at commit time
///
/// One pending request per property; a later call replaces an earlier one.
#[derive(Debug, Default)]
pub(crate) struct EditPlan {
    pub replace_needed: Option<(String, String)>,
    pub soname: Option<PropertyAction>,
    pub runtime_path: Option<PropertyAction>,
    pub priority: Priority,
    pub fix_missing: bool,
}

/// One decoded tag/value pair, remembered with its byte position so the tag
/// can be rewritten later
#[derive(Debug, Clone, Copy)]
pub struct DynEntry {
    pub at: usize,
    pub tag: i64,
    pub value: u64,
}

/// The loaded PT_DYNAMIC segment
///
/// Exactly `p_filesz` bytes, mutated in place and written back wholesale
/// only if some tag changed. All access goes through the image's
/// width/endianness primitives.
pub struct DynamicTable {
    segment: Segment,
    bytes: Vec<u8>,
    modified: bool,
}

impl DynamicTable {
    pub fn new(segment: Segment, bytes: Vec<u8>) -> Self {
        Self {
            segment,
            bytes,
            modified: false,
        }
    }

    /// File region this table mirrors
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether any tag changed since loading
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Iterate every fixed-width pair in the segment
    ///
    /// The walk covers the whole segment length, not just entries up to a
    /// DT_NULL terminator; trailing zero pairs decode as harmless no-ops.
    pub fn entries<'a>(&'a self, image: &'a ElfImage) -> impl Iterator<Item = DynEntry> + 'a {
        let step = image.dyn_entry_size();
        let bytes = &self.bytes;
        (0..)
            .map(move |i| i * step)
            .take_while(move |at| at + step <= bytes.len())
            .map(move |at| DynEntry {
                at,
                tag: image.dyn_tag(bytes, at),
                value: image.dyn_value(bytes, at),
            })
    }

    /// Rewrite the tag of the entry at byte `at`, leaving its value alone
    pub fn set_tag(&mut self, image: &ElfImage, at: usize, tag: i64) {
        image.write_dyn_tag(&mut self.bytes, at, tag);
        self.modified = true;
    }
}
