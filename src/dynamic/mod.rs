//! Dynamic-section editing: entry classification, in-place string
//! replacement, tag rewrites and the two commit strategies

mod editor;
mod types;
mod writer;

pub use types::DynEntry;
pub use types::DynamicTable;
pub use types::Priority;
pub use types::PropertyAction;
pub use types::RuntimePath;
pub use types::RuntimePathKind;

pub(crate) use editor::Editor;
pub(crate) use types::EditPlan;
pub(crate) use writer::commit_copy;
pub(crate) use writer::commit_in_place;
