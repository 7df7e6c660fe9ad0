//! Commit strategies - overwrite regions in place, or stream a byte-exact
//! copy with the modified regions substituted in transit
//!
//! The in-place path writes the string table and then, only if some tag
//! changed, the dynamic segment; a run killed between the two writes leaves
//! a mixed file. The copy path only ever writes forward, so an interrupted
//! run yields a short, diagnosable output instead.

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

use crate::error::ElfError;
use crate::strtab::StringTable;

use super::types::DynamicTable;

/// Overwrite the changed regions directly in the input file
pub(crate) fn commit_in_place(
    path: &Path,
    dynamic: &DynamicTable,
    strtab: &StringTable,
) -> Result<(), ElfError> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;

    file.seek(SeekFrom::Start(strtab.section().offset))?;
    file.write_all(strtab.bytes())?;

    if dynamic.is_modified() {
        file.seek(SeekFrom::Start(dynamic.segment().offset))?;
        file.write_all(dynamic.bytes())?;
    }

    file.flush()?;
    Ok(())
}

/// Stream a byte-exact copy of the input to `output`, substituting the
/// string table and (if its tags changed) the dynamic segment at their
/// original offsets
///
/// The input's permission bits are replicated onto the output before any
/// data is written. Every byte outside the substituted regions is copied
/// verbatim, so the output has the input's exact length.
pub(crate) fn commit_copy(
    input: &Path,
    output: &Path,
    dynamic: &DynamicTable,
    strtab: &StringTable,
) -> Result<(), ElfError> {
    let in_file = File::open(input)?;
    let permissions = in_file.metadata()?.permissions();

    let out_file = File::create(output)?;
    out_file.set_permissions(permissions)?;

    let mut reader = BufReader::new(in_file);
    let mut writer = BufWriter::new(out_file);

    // Substituted regions in ascending file order, so either section
    // ordering round-trips
    let mut regions: Vec<(u64, &[u8])> = vec![(strtab.section().offset, strtab.bytes())];
    if dynamic.is_modified() {
        regions.push((dynamic.segment().offset, dynamic.bytes()));
    }
    regions.sort_by_key(|&(offset, _)| offset);

    let mut pos = 0u64;
    for (offset, bytes) in regions {
        if offset < pos {
            return Err(ElfError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "modified regions overlap",
            )));
        }
        copy_exact(&mut reader, &mut writer, offset - pos)?;
        writer.write_all(bytes)?;
        reader.seek_relative(bytes.len() as i64)?;
        pos = offset + bytes.len() as u64;
    }

    io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(())
}

/// Copy exactly `n` bytes between the streams
fn copy_exact<R: Read, W: Write>(reader: &mut R, writer: &mut W, n: u64) -> Result<(), ElfError> {
    let copied = io::copy(&mut reader.by_ref().take(n), writer)?;
    if copied != n {
        return Err(ElfError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "input file ended before the modified region",
        )));
    }
    Ok(())
}
