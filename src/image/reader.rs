//! ELF image reader - classifies a file once, then serves normalized reads
//!
//! The class (32/64-bit) and data encoding detected at open time are fixed
//! for the image's lifetime and govern every later field access. Nothing
//! outside this module interprets raw ELF bytes.

use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use crate::error::ElfError;

use super::types::Class;
use super::types::Encoding;
use super::types::Header;
use super::types::Section;
use super::types::Segment;
use super::types::EI_CLASS;
use super::types::EI_DATA;
use super::types::EI_NIDENT;
use super::types::EI_VERSION;
use super::types::ELFCLASS32;
use super::types::ELFCLASS64;
use super::types::ELFDATA2LSB;
use super::types::ELFDATA2MSB;
use super::types::ELFMAG;
use super::types::EV_CURRENT;

/// An open ELF file plus the class and encoding detected at open time
pub struct ElfImage {
    file: File,
    path: PathBuf,
    class: Class,
    encoding: Encoding,
    header: Header,
}

impl ElfImage {
    /// Open an ELF file read-only and validate its identification
    ///
    /// Rejects the file unless magic, class, data encoding and version are
    /// all recognized, and unless the declared program-header entry size
    /// matches the detected class (catches foreign or corrupt files that
    /// pass the magic check).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ElfError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;

        let mut ident = [0u8; EI_NIDENT];
        file.read_exact(&mut ident)?;

        if ident[..4] != ELFMAG[..]
            || (ident[EI_CLASS] != ELFCLASS32 && ident[EI_CLASS] != ELFCLASS64)
            || (ident[EI_DATA] != ELFDATA2LSB && ident[EI_DATA] != ELFDATA2MSB)
            || ident[EI_VERSION] != EV_CURRENT
        {
            return Err(ElfError::NotAnElf(path.display().to_string()));
        }

        let class = if ident[EI_CLASS] == ELFCLASS32 {
            Class::Elf32
        } else {
            Class::Elf64
        };
        let encoding = if ident[EI_DATA] == ELFDATA2LSB {
            Encoding::Lsb
        } else {
            Encoding::Msb
        };

        // Read the rest of the class-sized header
        let mut buf = vec![0u8; class.ehdr_size()];
        buf[..EI_NIDENT].copy_from_slice(&ident);
        file.read_exact(&mut buf[EI_NIDENT..])?;

        let header = Header::parse(class, encoding, &buf);

        let expected = class.phdr_size() as u16;
        if header.phentsize() != expected {
            return Err(ElfError::MalformedHeader {
                expected,
                found: header.phentsize(),
            });
        }

        Ok(Self {
            file,
            path,
            class,
            encoding,
            header,
        })
    }

    /// Path the image was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Whether this is a 64-bit image
    pub fn is_64(&self) -> bool {
        self.class == Class::Elf64
    }

    /// Whether the file's byte order differs from the host's
    pub fn swap_endian(&self) -> bool {
        self.encoding != Encoding::native()
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Scan the program-header table for the first segment of `p_type`
    ///
    /// A present-but-empty segment is treated as absent.
    pub fn find_program_segment(&self, p_type: u32) -> Result<Segment, ElfError> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(self.header.phoff()))?;

        let mut buf = vec![0u8; self.class.phdr_size()];
        for _ in 0..self.header.phnum() {
            file.read_exact(&mut buf)?;
            let segment = Segment::parse(self.class, self.encoding, &buf);
            if segment.p_type == p_type {
                if segment.filesz == 0 {
                    return Err(ElfError::ZeroLengthSegment(p_type));
                }
                return Ok(segment);
            }
        }

        Err(ElfError::SegmentNotFound(p_type))
    }

    /// Scan the section-header table for the first section of `sh_type`
    pub fn find_section(&self, sh_type: u32) -> Result<Section, ElfError> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(self.header.shoff()))?;

        let mut buf = vec![0u8; self.class.shdr_size()];
        for _ in 0..self.header.shnum() {
            file.read_exact(&mut buf)?;
            let section = Section::parse(self.class, self.encoding, &buf);
            if section.sh_type == sh_type {
                if section.size == 0 {
                    return Err(ElfError::ZeroLengthSection(sh_type));
                }
                return Ok(section);
            }
        }

        Err(ElfError::SectionNotFound(sh_type))
    }

    /// Load a segment's bytes into memory
    pub fn read_segment(&self, segment: &Segment) -> Result<Vec<u8>, ElfError> {
        self.read_at(segment.offset, segment.filesz as usize)
    }

    /// Load a section's bytes into memory
    pub fn read_section(&self, section: &Section) -> Result<Vec<u8>, ElfError> {
        self.read_at(section.offset, section.size as usize)
    }

    fn read_at(&self, offset: u64, size: usize) -> Result<Vec<u8>, ElfError> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Size in bytes of one dynamic-table tag/value pair
    pub fn dyn_entry_size(&self) -> usize {
        self.class.dyn_size()
    }

    /// Tag of the dynamic entry starting at byte `at`, sign-widened
    pub fn dyn_tag(&self, buf: &[u8], at: usize) -> i64 {
        match self.class {
            Class::Elf32 => i64::from(self.encoding.read_i32(&buf[at..])),
            Class::Elf64 => self.encoding.read_i64(&buf[at..]),
        }
    }

    /// Value of the dynamic entry starting at byte `at`
    pub fn dyn_value(&self, buf: &[u8], at: usize) -> u64 {
        match self.class {
            Class::Elf32 => u64::from(self.encoding.read_u32(&buf[at + 4..])),
            Class::Elf64 => self.encoding.read_u64(&buf[at + 8..]),
        }
    }

    /// Rewrite the tag of the dynamic entry starting at byte `at`, leaving
    /// its value untouched
    pub fn write_dyn_tag(&self, buf: &mut [u8], at: usize, tag: i64) {
        match self.class {
            Class::Elf32 => self.encoding.write_i32(&mut buf[at..at + 4], tag as i32),
            Class::Elf64 => self.encoding.write_i64(&mut buf[at..at + 8], tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use byteorder::BigEndian;
    use byteorder::ByteOrder;
    use byteorder::LittleEndian;
    use tempfile::NamedTempFile;

    use super::super::types::*;
    use super::*;

    /// Minimal 64-bit little-endian image: header, one PT_DYNAMIC program
    /// header, one SHT_STRTAB section header, and the two regions
    fn build_elf64_le() -> Vec<u8> {
        let mut buf = vec![0u8; 0x200];
        buf[..4].copy_from_slice(ELFMAG);
        buf[EI_CLASS] = ELFCLASS64;
        buf[EI_DATA] = ELFDATA2LSB;
        buf[EI_VERSION] = EV_CURRENT;
        LittleEndian::write_u64(&mut buf[32..], 0x40); // e_phoff
        LittleEndian::write_u64(&mut buf[40..], 0x78); // e_shoff
        LittleEndian::write_u16(&mut buf[54..], 56); // e_phentsize
        LittleEndian::write_u16(&mut buf[56..], 1); // e_phnum
        LittleEndian::write_u16(&mut buf[58..], 64); // e_shentsize
        LittleEndian::write_u16(&mut buf[60..], 1); // e_shnum

        // PT_DYNAMIC at 0x100, 32 bytes
        LittleEndian::write_u32(&mut buf[0x40..], PT_DYNAMIC);
        LittleEndian::write_u64(&mut buf[0x48..], 0x100); // p_offset
        LittleEndian::write_u64(&mut buf[0x60..], 32); // p_filesz

        // SHT_STRTAB at 0x180, 16 bytes
        LittleEndian::write_u32(&mut buf[0x78 + 4..], SHT_STRTAB);
        LittleEndian::write_u64(&mut buf[0x78 + 24..], 0x180); // sh_offset
        LittleEndian::write_u64(&mut buf[0x78 + 32..], 16); // sh_size

        // One DT_NEEDED entry pointing at offset 1
        LittleEndian::write_u64(&mut buf[0x100..], DT_NEEDED as u64);
        LittleEndian::write_u64(&mut buf[0x108..], 1);

        buf[0x181..0x181 + 8].copy_from_slice(b"libc.so\0");
        buf
    }

    /// Same shape, 32-bit big-endian
    fn build_elf32_be() -> Vec<u8> {
        let mut buf = vec![0u8; 0x200];
        buf[..4].copy_from_slice(ELFMAG);
        buf[EI_CLASS] = ELFCLASS32;
        buf[EI_DATA] = ELFDATA2MSB;
        buf[EI_VERSION] = EV_CURRENT;
        BigEndian::write_u32(&mut buf[28..], 0x40); // e_phoff
        BigEndian::write_u32(&mut buf[32..], 0x78); // e_shoff
        BigEndian::write_u16(&mut buf[42..], 32); // e_phentsize
        BigEndian::write_u16(&mut buf[44..], 1); // e_phnum
        BigEndian::write_u16(&mut buf[46..], 40); // e_shentsize
        BigEndian::write_u16(&mut buf[48..], 1); // e_shnum

        BigEndian::write_u32(&mut buf[0x40..], PT_DYNAMIC);
        BigEndian::write_u32(&mut buf[0x44..], 0x100); // p_offset
        BigEndian::write_u32(&mut buf[0x50..], 16); // p_filesz

        BigEndian::write_u32(&mut buf[0x78 + 4..], SHT_STRTAB);
        BigEndian::write_u32(&mut buf[0x78 + 16..], 0x180); // sh_offset
        BigEndian::write_u32(&mut buf[0x78 + 20..], 16); // sh_size

        BigEndian::write_u32(&mut buf[0x100..], DT_NEEDED as u32);
        BigEndian::write_u32(&mut buf[0x104..], 1);

        buf[0x181..0x181 + 8].copy_from_slice(b"libc.so\0");
        buf
    }

    fn write_temp(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_open_classifies_64_le() {
        let file = write_temp(&build_elf64_le());
        let image = ElfImage::open(file.path()).unwrap();
        assert!(image.is_64());
        assert_eq!(image.encoding(), Encoding::Lsb);
        assert_eq!(image.dyn_entry_size(), 16);
    }

    #[test]
    fn test_open_classifies_32_be() {
        let file = write_temp(&build_elf32_be());
        let image = ElfImage::open(file.path()).unwrap();
        assert!(!image.is_64());
        assert_eq!(image.encoding(), Encoding::Msb);
        assert_eq!(image.dyn_entry_size(), 8);
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let mut data = build_elf64_le();
        data[0] = b'X';
        let file = write_temp(&data);
        assert!(matches!(
            ElfImage::open(file.path()),
            Err(ElfError::NotAnElf(_))
        ));
    }

    #[test]
    fn test_open_rejects_bad_class() {
        let mut data = build_elf64_le();
        data[EI_CLASS] = 7;
        let file = write_temp(&data);
        assert!(matches!(
            ElfImage::open(file.path()),
            Err(ElfError::NotAnElf(_))
        ));
    }

    #[test]
    fn test_open_rejects_bad_encoding() {
        let mut data = build_elf64_le();
        data[EI_DATA] = 0;
        let file = write_temp(&data);
        assert!(matches!(
            ElfImage::open(file.path()),
            Err(ElfError::NotAnElf(_))
        ));
    }

    #[test]
    fn test_open_rejects_bad_version() {
        let mut data = build_elf64_le();
        data[EI_VERSION] = 0;
        let file = write_temp(&data);
        assert!(matches!(
            ElfImage::open(file.path()),
            Err(ElfError::NotAnElf(_))
        ));
    }

    #[test]
    fn test_open_rejects_phentsize_mismatch() {
        let mut data = build_elf64_le();
        LittleEndian::write_u16(&mut data[54..], 32); // 32-bit size in a 64-bit file
        let file = write_temp(&data);
        assert!(matches!(
            ElfImage::open(file.path()),
            Err(ElfError::MalformedHeader {
                expected: 56,
                found: 32
            })
        ));
    }

    #[test]
    fn test_find_dynamic_segment() {
        let file = write_temp(&build_elf64_le());
        let image = ElfImage::open(file.path()).unwrap();
        let segment = image.find_program_segment(PT_DYNAMIC).unwrap();
        assert_eq!(segment.offset, 0x100);
        assert_eq!(segment.filesz, 32);
    }

    #[test]
    fn test_find_missing_segment() {
        let file = write_temp(&build_elf64_le());
        let image = ElfImage::open(file.path()).unwrap();
        assert!(matches!(
            image.find_program_segment(1),
            Err(ElfError::SegmentNotFound(1))
        ));
    }

    #[test]
    fn test_zero_length_segment_is_absent() {
        let mut data = build_elf64_le();
        LittleEndian::write_u64(&mut data[0x60..], 0); // p_filesz = 0
        let file = write_temp(&data);
        let image = ElfImage::open(file.path()).unwrap();
        assert!(matches!(
            image.find_program_segment(PT_DYNAMIC),
            Err(ElfError::ZeroLengthSegment(_))
        ));
    }

    #[test]
    fn test_find_strtab_section() {
        let file = write_temp(&build_elf32_be());
        let image = ElfImage::open(file.path()).unwrap();
        let section = image.find_section(SHT_STRTAB).unwrap();
        assert_eq!(section.offset, 0x180);
        assert_eq!(section.size, 16);
    }

    #[test]
    fn test_dyn_pair_reads_both_classes() {
        for data in [build_elf64_le(), build_elf32_be()] {
            let file = write_temp(&data);
            let image = ElfImage::open(file.path()).unwrap();
            let segment = image.find_program_segment(PT_DYNAMIC).unwrap();
            let dyns = image.read_segment(&segment).unwrap();
            assert_eq!(image.dyn_tag(&dyns, 0), DT_NEEDED);
            assert_eq!(image.dyn_value(&dyns, 0), 1);
        }
    }

    #[test]
    fn test_write_dyn_tag_round_trip() {
        let file = write_temp(&build_elf32_be());
        let image = ElfImage::open(file.path()).unwrap();
        let segment = image.find_program_segment(PT_DYNAMIC).unwrap();
        let mut dyns = image.read_segment(&segment).unwrap();
        image.write_dyn_tag(&mut dyns, 0, DT_DEBUG);
        assert_eq!(image.dyn_tag(&dyns, 0), DT_DEBUG);
        assert_eq!(image.dyn_value(&dyns, 0), 1);
    }
}
