//! Shared-library cache parsing and name resolution
//!
//! Parses the glibc cache format: a fixed magic string, a header carrying
//! the entry count, an array of fixed-size records, then a string pool.
//! Only records flagged as ELF libraries are indexed. The cache is a
//! host-generated file, so fields are read in native byte order.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use byteorder::ByteOrder;
use byteorder::NativeEndian;

use crate::error::CacheError;

/// Magic string opening a cache file in the modern format
const CACHE_MAGIC: &[u8] = b"glibc-ld.so.cache1.1";

/// Record describes an ELF library
const FLAG_ELF: i32 = 0x01;

/// Longest pool string the parser will follow
const PATH_MAX: usize = 4096;

/// Magic, entry count, six reserved words
const HEADER_SIZE: usize = CACHE_MAGIC.len() + 4 + 6 * 4;

/// Flags, name offset, path offset, os version, hwcap mask
const ENTRY_SIZE: usize = 24;

/// Where the system keeps its cache
pub const DEFAULT_CACHE_PATH: &str = "/etc/ld.so.cache";

/// Well-known directories probed before the cache itself is consulted
const SYSTEM_LIB_DIRS: &[&str] = &["/lib", "/lib64", "/usr/lib", "/usr/lib64", "/usr/local/lib"];

/// One indexed cache record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Library name as the dynamic linker knows it (e.g. "libm.so.6")
    pub name: String,
    /// Full path of the cached file
    pub path: String,
}

/// The parsed shared-library cache plus any extra search directories
/// registered from a run-time path
pub struct LdCache {
    entries: Vec<CacheEntry>,
    search_dirs: Vec<PathBuf>,
}

impl LdCache {
    /// Parse a cache file from disk
    pub fn parse(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }

    /// Parse cache bytes already in memory
    pub fn from_bytes(data: &[u8]) -> Result<Self, CacheError> {
        if data.len() < HEADER_SIZE || &data[..CACHE_MAGIC.len()] != CACHE_MAGIC {
            return Err(CacheError::InvalidFormat);
        }

        let count = NativeEndian::read_u32(&data[CACHE_MAGIC.len()..]) as usize;
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_SIZE + i * ENTRY_SIZE;
            if at + ENTRY_SIZE > data.len() {
                break;
            }
            let flags = NativeEndian::read_i32(&data[at..]);
            if flags & FLAG_ELF == 0 {
                continue;
            }
            let name_offset = NativeEndian::read_u32(&data[at + 4..]) as usize;
            let path_offset = NativeEndian::read_u32(&data[at + 8..]) as usize;
            // An entry with an unreadable string is skipped, not fatal
            let (Some(name), Some(path)) = (
                pool_string(data, name_offset),
                pool_string(data, path_offset),
            ) else {
                continue;
            };
            entries.push(CacheEntry { name, path });
        }

        Ok(Self {
            entries,
            search_dirs: Vec::new(),
        })
    }

    /// Number of indexed (ELF-flagged) entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }

    /// Directories registered through [`register_search_path`](Self::register_search_path)
    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Whether a library of exactly this name can be found
    ///
    /// The filesystem is checked first (well-known system directories, then
    /// registered search directories): the cache can be stale.
    pub fn exists(&self, name: &str) -> bool {
        for dir in SYSTEM_LIB_DIRS {
            if Path::new(dir).join(name).is_file() {
                return true;
            }
        }
        for dir in &self.search_dirs {
            if dir.join(name).is_file() {
                return true;
            }
        }
        self.entries.iter().any(|entry| entry.name == name)
    }

    /// Cached path for an exact name match
    ///
    /// Linear scan; the cache is not guaranteed to be sorted.
    pub fn find(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.path.as_str())
    }

    /// First other cache entry that looks like another version of `name`
    ///
    /// The base identifier is the text before the first '.' (`libfoo.so.6`
    /// -> `libfoo`). Returns at most one candidate; versions are not
    /// ranked.
    pub fn suggest_replacement(&self, name: &str) -> Option<&str> {
        let base = base_identifier(name);
        self.entries
            .iter()
            .filter(|entry| entry.name != name)
            .find(|entry| base_identifier(&entry.name) == base)
            .map(|entry| entry.name.as_str())
    }

    /// Expand a colon-separated search path and register its directories
    ///
    /// The `$ORIGIN`/`${ORIGIN}` placeholder stands for the directory
    /// containing `elf_path`. Registered directories take part in every
    /// later [`exists`](Self::exists) lookup.
    pub fn register_search_path(&mut self, raw: &str, elf_path: &Path) {
        let origin = elf_path
            .parent()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();
        for segment in raw.split(':') {
            if segment.is_empty() {
                continue;
            }
            let dir = segment.replace("${ORIGIN}", &origin).replace("$ORIGIN", &origin);
            self.search_dirs.push(PathBuf::from(dir));
        }
    }
}

fn base_identifier(name: &str) -> &str {
    name.split_once('.').map(|(base, _)| base).unwrap_or(name)
}

/// Read a NUL- or PATH_MAX-bounded string from the pool
fn pool_string(data: &[u8], offset: usize) -> Option<String> {
    if offset >= data.len() {
        return None;
    }
    let tail = &data[offset..];
    let limit = tail.len().min(PATH_MAX);
    let end = tail[..limit].iter().position(|&b| b == 0).unwrap_or(limit);
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use byteorder::WriteBytesExt;
    use tempfile::TempDir;

    use super::*;

    /// Serialize a cache image: header, entries, string pool
    fn build_cache(entries: &[(i32, &str, &str)]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(CACHE_MAGIC);
        data.write_u32::<NativeEndian>(entries.len() as u32).unwrap();
        data.extend_from_slice(&[0u8; 24]); // reserved words

        let pool_base = HEADER_SIZE + entries.len() * ENTRY_SIZE;
        let mut pool: Vec<u8> = Vec::new();
        for (flags, name, path) in entries {
            data.write_i32::<NativeEndian>(*flags).unwrap();
            data.write_u32::<NativeEndian>((pool_base + pool.len()) as u32)
                .unwrap();
            pool.extend_from_slice(name.as_bytes());
            pool.push(0);
            data.write_u32::<NativeEndian>((pool_base + pool.len()) as u32)
                .unwrap();
            pool.extend_from_slice(path.as_bytes());
            pool.push(0);
            data.write_u32::<NativeEndian>(0).unwrap(); // os version
            data.write_u64::<NativeEndian>(0).unwrap(); // hwcap
        }
        data.extend_from_slice(&pool);
        data
    }

    #[test]
    fn test_parse_indexes_only_elf_entries() {
        let data = build_cache(&[
            (FLAG_ELF, "libfoo.so.1", "/usr/lib/libfoo.so.1"),
            (0, "libancient.a", "/usr/lib/libancient.a"),
            (FLAG_ELF | 0x100, "libbar.so.0", "/usr/lib/libbar.so.0"),
        ]);
        let cache = LdCache::from_bytes(&data).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.entries()[0].name, "libfoo.so.1");
        assert_eq!(cache.entries()[1].name, "libbar.so.0");
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut data = build_cache(&[(FLAG_ELF, "libfoo.so.1", "/usr/lib/libfoo.so.1")]);
        data[0] = b'x';
        assert!(matches!(
            LdCache::from_bytes(&data),
            Err(CacheError::InvalidFormat)
        ));
        assert!(matches!(
            LdCache::from_bytes(b"short"),
            Err(CacheError::InvalidFormat)
        ));
    }

    #[test]
    fn test_exists_and_find() {
        let data = build_cache(&[(FLAG_ELF, "libm.so.6", "/usr/lib/libm.so.6")]);
        let cache = LdCache::from_bytes(&data).unwrap();
        assert!(cache.exists("libm.so.6"));
        assert!(!cache.exists("libnothere.so.9"));
        assert_eq!(cache.find("libm.so.6"), Some("/usr/lib/libm.so.6"));
        assert_eq!(cache.find("libnothere.so.9"), None);
    }

    #[test]
    fn test_registered_directory_beats_cache() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("liblocal.so.1")).unwrap();

        let data = build_cache(&[(FLAG_ELF, "libm.so.6", "/usr/lib/libm.so.6")]);
        let mut cache = LdCache::from_bytes(&data).unwrap();
        assert!(!cache.exists("liblocal.so.1"));

        let elf_path = dir.path().join("app");
        cache.register_search_path("$ORIGIN", &elf_path);
        assert!(cache.exists("liblocal.so.1"));
    }

    #[test]
    fn test_register_search_path_expands_origin() {
        let data = build_cache(&[]);
        let mut cache = LdCache::from_bytes(&data).unwrap();
        cache.register_search_path(
            "/opt/vendor/lib:$ORIGIN/../lib:${ORIGIN}",
            Path::new("/srv/app/bin/tool"),
        );
        assert_eq!(
            cache.search_dirs(),
            &[
                PathBuf::from("/opt/vendor/lib"),
                PathBuf::from("/srv/app/bin/../lib"),
                PathBuf::from("/srv/app/bin"),
            ]
        );
    }

    #[test]
    fn test_suggest_replacement() {
        let data = build_cache(&[
            (FLAG_ELF, "libfoo.so.1", "/usr/lib/libfoo.so.1"),
            (FLAG_ELF, "libfoo.so.2", "/usr/lib/libfoo.so.2"),
            (FLAG_ELF, "libbar.so.0", "/usr/lib/libbar.so.0"),
        ]);
        let cache = LdCache::from_bytes(&data).unwrap();
        assert_eq!(cache.suggest_replacement("libfoo.so.1"), Some("libfoo.so.2"));
        assert_eq!(cache.suggest_replacement("libfoo.so.2"), Some("libfoo.so.1"));
        assert_eq!(cache.suggest_replacement("libbar.so.0"), None);
    }

    #[test]
    fn test_truncated_entry_table_is_not_fatal() {
        let mut data = build_cache(&[
            (FLAG_ELF, "libfoo.so.1", "/usr/lib/libfoo.so.1"),
            (FLAG_ELF, "libfoo.so.2", "/usr/lib/libfoo.so.2"),
        ]);
        // Claim more entries than the file holds
        let at = CACHE_MAGIC.len();
        data[at..at + 4].copy_from_slice(&u32::to_ne_bytes(40_000));
        let cache = LdCache::from_bytes(&data).unwrap();
        assert!(cache.len() <= 2);
    }
}
