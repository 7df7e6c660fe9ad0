//! editelf: ELF dynamic-linking metadata editor
//!
//! This library inspects and rewrites the dynamic-linking metadata embedded
//! in ELF executables and shared objects: the needed-library list, the
//! SONAME, and the run-time search path (RPATH/RUNPATH). It never relinks
//! and never grows the file; every rewrite must fit inside the string-table
//! slack the file already has. Library names can be resolved against the
//! glibc shared-library cache.
//!
//! # Example
//!
//! ```no_run
//! use editelf::ElfEditor;
//!
//! // Open a shared object
//! let mut editor = ElfEditor::open("libwidget.so.1.2").unwrap();
//!
//! // Retarget a dependency
//! editor.replace_needed("libm.so.6", "libm.so");
//!
//! // Save a patched copy; the original is untouched
//! let report = editor.save("libwidget-patched.so").unwrap();
//! assert!(report.changed);
//! ```

pub mod dynamic;
pub mod error;
pub mod image;
pub mod ldcache;
pub mod strtab;

use std::borrow::Cow;
use std::path::Path;

pub use dynamic::DynamicTable;
pub use dynamic::Priority;
pub use dynamic::RuntimePath;
pub use dynamic::RuntimePathKind;
pub use error::CacheError;
pub use error::EditReport;
pub use error::EditWarning;
pub use error::ElfError;
pub use error::Property;
pub use image::ElfImage;
pub use ldcache::CacheEntry;
pub use ldcache::LdCache;
pub use ldcache::DEFAULT_CACHE_PATH;
pub use strtab::StringTable;

use dynamic::commit_copy;
use dynamic::commit_in_place;
use dynamic::EditPlan;
use dynamic::Editor;
use dynamic::PropertyAction;
use image::DT_NEEDED;
use image::DT_RPATH;
use image::DT_RUNPATH;
use image::DT_SONAME;
use image::PT_DYNAMIC;
use image::SHT_STRTAB;

/// High-level API for querying and editing ELF dynamic-linking metadata
///
/// Opening loads the PT_DYNAMIC segment and the dynamic string table into
/// memory. Mutations are only requested through the setters; they run once,
/// inside [`save`](Self::save) or [`apply`](Self::apply), which report what
/// was done and what could not be.
pub struct ElfEditor {
    image: ElfImage,
    dynamic: DynamicTable,
    strtab: StringTable,
    plan: EditPlan,
    cache: Option<LdCache>,
}

impl ElfEditor {
    /// Open an ELF file and load its dynamic table and string table
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ElfError> {
        let image = ElfImage::open(path)?;

        let segment = image.find_program_segment(PT_DYNAMIC)?;
        let dynamic = DynamicTable::new(segment, image.read_segment(&segment)?);

        let section = image.find_section(SHT_STRTAB)?;
        let strtab = StringTable::new(section, image.read_section(&section)?);

        Ok(Self {
            image,
            dynamic,
            strtab,
            plan: EditPlan::default(),
            cache: None,
        })
    }

    /// Path the file was opened from
    pub fn path(&self) -> &Path {
        self.image.path()
    }

    /// The underlying image, for width/endianness introspection
    pub fn image(&self) -> &ElfImage {
        &self.image
    }

    /// Attach a parsed shared-library cache
    ///
    /// With a cache attached, replacements are checked against it (a miss
    /// is an advisory warning) and [`fix_missing`](Self::fix_missing)
    /// becomes able to resolve substitutes.
    pub fn use_cache(&mut self, cache: LdCache) {
        self.cache = Some(cache);
    }

    /// Request replacing the needed library named `old` with `new`
    pub fn replace_needed(&mut self, old: impl Into<String>, new: impl Into<String>) {
        self.plan.replace_needed = Some((old.into(), new.into()));
    }

    /// Request setting the SONAME
    pub fn set_soname(&mut self, name: impl Into<String>) {
        self.plan.soname = Some(PropertyAction::Set(name.into()));
    }

    /// Request removing the SONAME entry
    pub fn remove_soname(&mut self) {
        self.plan.soname = Some(PropertyAction::Remove);
    }

    /// Request setting the run-time search path
    pub fn set_runtime_path(&mut self, path: impl Into<String>) {
        self.plan.runtime_path = Some(PropertyAction::Set(path.into()));
    }

    /// Request removing the run-time path entry
    pub fn remove_runtime_path(&mut self) {
        self.plan.runtime_path = Some(PropertyAction::Remove);
    }

    /// Request normalizing the run-time path priority
    pub fn set_priority(&mut self, priority: Priority) {
        self.plan.priority = priority;
    }

    /// Request rewriting needed libraries the cache cannot resolve to the
    /// closest other version it knows (requires an attached cache)
    pub fn fix_missing(&mut self) {
        self.plan.fix_missing = true;
    }

    /// Names of all needed libraries
    pub fn needed(&self) -> Vec<String> {
        self.dynamic
            .entries(&self.image)
            .filter(|entry| entry.tag == DT_NEEDED)
            .filter_map(|entry| self.strtab.string_at(entry.value))
            .map(Cow::into_owned)
            .collect()
    }

    /// The SONAME, if the file advertises one
    pub fn soname(&self) -> Option<String> {
        self.dynamic
            .entries(&self.image)
            .find(|entry| entry.tag == DT_SONAME)
            .and_then(|entry| self.strtab.string_at(entry.value))
            .map(Cow::into_owned)
    }

    /// The run-time search path, if present, with the tag kind carrying it
    pub fn runtime_path(&self) -> Option<RuntimePath> {
        let entry = self
            .dynamic
            .entries(&self.image)
            .find(|entry| entry.tag == DT_RPATH || entry.tag == DT_RUNPATH)?;
        let path = self.strtab.string_at(entry.value)?.into_owned();
        let kind = if entry.tag == DT_RPATH {
            RuntimePathKind::Rpath
        } else {
            RuntimePathKind::Runpath
        };
        Some(RuntimePath { kind, path })
    }

    /// Needed libraries the resolver cannot find anywhere
    ///
    /// The image's own run-time path is expanded against its location and
    /// registered on the cache before the lookup.
    pub fn missing_libraries(&self, cache: &mut LdCache) -> Vec<String> {
        if let Some(runtime_path) = self.runtime_path() {
            cache.register_search_path(&runtime_path.path, self.image.path());
        }
        self.needed()
            .into_iter()
            .filter(|name| !cache.exists(name))
            .collect()
    }

    /// Execute the pending requests and overwrite the input file in place
    ///
    /// Writes only the affected regions: the string table, then the dynamic
    /// segment if any tag changed. The two writes are not atomic together;
    /// a run killed between them leaves the file with mixed old and new
    /// bytes. Use [`save`](Self::save) when that risk is unacceptable.
    pub fn apply(&mut self) -> Result<EditReport, ElfError> {
        let report = self.execute();
        if report.changed {
            commit_in_place(self.image.path(), &self.dynamic, &self.strtab)?;
        }
        Ok(report)
    }

    /// Execute the pending requests and stream a patched copy to `output`
    ///
    /// The copy is byte-identical to the input outside the two rewritten
    /// regions and carries the input's permission bits. Nothing is written
    /// when no byte changed.
    pub fn save(&mut self, output: impl AsRef<Path>) -> Result<EditReport, ElfError> {
        let report = self.execute();
        if report.changed {
            commit_copy(
                self.image.path(),
                output.as_ref(),
                &self.dynamic,
                &self.strtab,
            )?;
        }
        Ok(report)
    }

    fn execute(&mut self) -> EditReport {
        let plan = std::mem::take(&mut self.plan);
        Editor::new(
            &self.image,
            &mut self.dynamic,
            &mut self.strtab,
            self.cache.as_ref(),
        )
        .execute(&plan)
    }
}
