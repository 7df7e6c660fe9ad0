//! Dynamic-table mutation engine
//!
//! Runs an edit plan against the in-memory dynamic table and string table:
//! one survey pass over reusable DT_DEBUG slots, one classify-and-mutate
//! pass over every entry, a promotion step for properties that found no
//! entry to carry them, and an optional cache-backed fixing pass. Entries
//! are never added or removed; removal rewrites a tag to DT_DEBUG and
//! addition claims such a slot back, so the table length is invariant.

use log::info;
use log::warn;

use crate::error::EditReport;
use crate::error::EditWarning;
use crate::error::Property;
use crate::image::ElfImage;
use crate::image::DT_DEBUG;
use crate::image::DT_NEEDED;
use crate::image::DT_RPATH;
use crate::image::DT_RUNPATH;
use crate::image::DT_SONAME;
use crate::ldcache::LdCache;
use crate::strtab::StringTable;

use super::types::DynEntry;
use super::types::DynamicTable;
use super::types::EditPlan;
use super::types::PropertyAction;
use super::types::Priority;

/// A surveyed DT_DEBUG entry whose string-table slot can be claimed
#[derive(Debug, Clone, Copy)]
struct DebugSlot {
    at: usize,
    str_offset: u64,
    span: usize,
}

/// Borrows the loaded tables for the duration of one plan execution
pub(crate) struct Editor<'a> {
    image: &'a ElfImage,
    dynamic: &'a mut DynamicTable,
    strtab: &'a mut StringTable,
    cache: Option<&'a LdCache>,
}

impl<'a> Editor<'a> {
    pub fn new(
        image: &'a ElfImage,
        dynamic: &'a mut DynamicTable,
        strtab: &'a mut StringTable,
        cache: Option<&'a LdCache>,
    ) -> Self {
        Self {
            image,
            dynamic,
            strtab,
            cache,
        }
    }

    /// Run the whole plan, accumulating warnings instead of aborting:
    /// per-entry misfits are reported and skipped, the rest of the plan
    /// still runs.
    pub fn execute(&mut self, plan: &EditPlan) -> EditReport {
        let mut report = EditReport::default();

        let soname_set = match &plan.soname {
            Some(PropertyAction::Set(s)) => Some(s.as_str()),
            _ => None,
        };
        let path_set = match &plan.runtime_path {
            Some(PropertyAction::Set(s)) => Some(s.as_str()),
            _ => None,
        };

        // Removed entries become DT_DEBUG, so existing DT_DEBUG entries are
        // the slots an added property can claim back
        let mut slots = if soname_set.is_some() || path_set.is_some() {
            self.survey_debug_slots()
        } else {
            Vec::new()
        };

        let mut needed_found = false;
        let mut soname_found = false;
        let mut path_found = false;

        for entry in self.collect_entries() {
            match entry.tag {
                DT_NEEDED => {
                    self.edit_needed(&entry, plan, &mut needed_found, &mut report);
                }
                DT_SONAME => {
                    if let Some(action) = &plan.soname {
                        soname_found = true;
                        self.edit_string_entry(&entry, action, Property::Soname, &mut report);
                    }
                }
                DT_RPATH | DT_RUNPATH => {
                    self.normalize_priority(&entry, plan.priority);
                    if let Some(action) = &plan.runtime_path {
                        path_found = true;
                        self.edit_string_entry(&entry, action, Property::RuntimePath, &mut report);
                    }
                }
                _ => {}
            }
        }

        // A property that was asked for but has no entry claims a surveyed
        // slot, largest available span first, one distinct slot each
        slots.sort_by_key(|slot| std::cmp::Reverse(slot.span));
        let mut slots = slots.into_iter();

        if let Some(name) = soname_set {
            if !soname_found {
                if let Some(slot) = slots.next() {
                    soname_found = true;
                    self.promote_slot(slot, DT_SONAME, name, Property::Soname, &mut report);
                }
            }
        }
        if let Some(path) = path_set {
            if !path_found {
                if let Some(slot) = slots.next() {
                    path_found = true;
                    let tag = match plan.priority {
                        Priority::PreferRunpath => DT_RUNPATH,
                        _ => DT_RPATH,
                    };
                    self.promote_slot(slot, tag, path, Property::RuntimePath, &mut report);
                }
            }
        }

        if plan.fix_missing {
            self.fix_missing(&mut report);
        }

        if plan.replace_needed.is_some() && !needed_found {
            warn!("no needed library matched the requested replacement");
            report.warnings.push(EditWarning::TargetNotFound {
                property: Property::Needed,
            });
        }
        if plan.soname.is_some() && !soname_found {
            warn!("no available entry was found to modify the soname");
            report.warnings.push(EditWarning::TargetNotFound {
                property: Property::Soname,
            });
        }
        if plan.runtime_path.is_some() && !path_found {
            warn!("no available entry was found to modify the run-time path");
            report.warnings.push(EditWarning::TargetNotFound {
                property: Property::RuntimePath,
            });
        }

        report.changed = self.dynamic.is_modified() || self.strtab.is_modified();
        report
    }

    fn collect_entries(&self) -> Vec<DynEntry> {
        self.dynamic.entries(self.image).collect()
    }

    /// Record DT_DEBUG entries whose value is a plausible string-table
    /// offset, keeping the first two found in encounter order
    fn survey_debug_slots(&self) -> Vec<DebugSlot> {
        let mut slots: Vec<DebugSlot> = Vec::new();
        for entry in self.dynamic.entries(self.image) {
            if entry.tag != DT_DEBUG || entry.value > self.strtab.len() as u64 {
                continue;
            }
            slots.push(DebugSlot {
                at: entry.at,
                str_offset: entry.value,
                span: self.strtab.available_span(entry.value),
            });
            if slots.len() == 2 {
                break;
            }
        }
        slots
    }

    fn edit_needed(
        &mut self,
        entry: &DynEntry,
        plan: &EditPlan,
        found: &mut bool,
        report: &mut EditReport,
    ) {
        let Some((old, new)) = &plan.replace_needed else {
            return;
        };
        match self.strtab.string_at(entry.value) {
            Some(name) if name == old.as_str() => {}
            _ => return,
        }
        *found = true;

        let available = self.strtab.available_span(entry.value);
        if new.len() > available {
            warn!("the new name {new} is too big to fit");
            report.warnings.push(EditWarning::StringTooLarge {
                property: Property::Needed,
                requested: new.clone(),
                available,
            });
            return;
        }

        info!("replacing needed library: {old} => {new}");
        if let Some(cache) = self.cache {
            if !cache.exists(new) {
                warn!("the library name {new} was not found in the cache");
                report
                    .warnings
                    .push(EditWarning::LibraryNotInCache { name: new.clone() });
            }
        }
        self.strtab.write_padded(entry.value, new, available);
    }

    /// Shared handler for the single-string properties: removal turns the
    /// tag into DT_DEBUG (value untouched), replacement overwrites the
    /// string in place when it fits
    fn edit_string_entry(
        &mut self,
        entry: &DynEntry,
        action: &PropertyAction,
        property: Property,
        report: &mut EditReport,
    ) {
        match action {
            PropertyAction::Remove => {
                info!("removing {property} entry");
                self.dynamic.set_tag(self.image, entry.at, DT_DEBUG);
            }
            PropertyAction::Set(requested) => {
                let available = self.strtab.available_span(entry.value);
                if requested.len() > available {
                    warn!("the new {property} is too big to fit");
                    report.warnings.push(EditWarning::StringTooLarge {
                        property,
                        requested: requested.clone(),
                        available,
                    });
                    return;
                }
                info!("setting {property}: {requested}");
                self.strtab.write_padded(entry.value, requested, available);
            }
        }
    }

    /// Rewrite an RPATH/RUNPATH tag to the other kind when a normalization
    /// was requested; idempotent on an already-normalized entry
    fn normalize_priority(&mut self, entry: &DynEntry, priority: Priority) {
        match (entry.tag, priority) {
            (DT_RPATH, Priority::PreferRunpath) => {
                info!("changing run-time priority to low");
                self.dynamic.set_tag(self.image, entry.at, DT_RUNPATH);
            }
            (DT_RUNPATH, Priority::PreferRpath) => {
                info!("changing run-time priority to high");
                self.dynamic.set_tag(self.image, entry.at, DT_RPATH);
            }
            _ => {}
        }
    }

    /// Claim a surveyed DT_DEBUG slot for a property that had no entry.
    /// A misfit still consumes the slot: the request had its chance and is
    /// reported as too large, not as missing a target.
    fn promote_slot(
        &mut self,
        slot: DebugSlot,
        tag: i64,
        requested: &str,
        property: Property,
        report: &mut EditReport,
    ) {
        if requested.len() > slot.span {
            warn!("the new {property} is too big to fit");
            report.warnings.push(EditWarning::StringTooLarge {
                property,
                requested: requested.to_string(),
                available: slot.span,
            });
            return;
        }
        info!("adding {property}: {requested}");
        self.dynamic.set_tag(self.image, slot.at, tag);
        self.strtab.write_padded(slot.str_offset, requested, slot.span);
    }

    /// Late fixing pass: rewrite needed libraries the cache cannot resolve
    /// to the closest other version it knows, when that fits
    fn fix_missing(&mut self, report: &mut EditReport) {
        let Some(cache) = self.cache else {
            return;
        };
        for entry in self.collect_entries() {
            if entry.tag != DT_NEEDED {
                continue;
            }
            let Some(name) = self.strtab.string_at(entry.value) else {
                continue;
            };
            let name = name.into_owned();
            if cache.exists(&name) {
                continue;
            }

            let available = self.strtab.available_span(entry.value);
            match cache.suggest_replacement(&name) {
                Some(replacement) if replacement.len() <= available => {
                    info!("fixing needed library: {name} => {replacement}");
                    let replacement = replacement.to_string();
                    self.strtab.write_padded(entry.value, &replacement, available);
                }
                _ => {
                    warn!("failed to find a replacement for {name}");
                    report
                        .warnings
                        .push(EditWarning::NoReplacementFound { name });
                }
            }
        }
    }
}
