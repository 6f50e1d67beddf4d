//! Export/import files and the plain-text ingestion format.
//!
//! Export file format:
//! ```text
//! [entry_count: u64]
//! [entry_size: u64][serialized entry] * entry_count
//! ```
//!
//! Ingestion text format, one block per entry:
//! ```text
//! TAGS
//! <tag>
//! ...
//! VALUE
//! <value line>
//! ...
//! END
//! ```
//! Lines outside a block are ignored. Value lines are kept with their
//! trailing newline.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::entry::DbEntry;
use crate::error::{DecodeError, PandoError, Result};
use crate::wire::codec::{ByteReader, ByteWriter};

/// Serialize entries in export format.
pub fn serialize_entries<'a>(entries: impl ExactSizeIterator<Item = &'a DbEntry>) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.put_len(entries.len());
    for entry in entries {
        w.put_len(entry.encoded_len());
        entry.encode(&mut w);
    }
    w.into_inner()
}

pub fn deserialize_entries(bytes: &[u8]) -> std::result::Result<Vec<DbEntry>, DecodeError> {
    let mut r = ByteReader::new(bytes);
    let count = r.get_len(8)?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let size = r.get_len(1)?;
        entries.push(DbEntry::from_bytes(r.take(size)?)?);
    }
    r.finish()?;
    Ok(entries)
}

pub fn write_export<'a>(path: &Path, entries: impl ExactSizeIterator<Item = &'a DbEntry>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&serialize_entries(entries))?;
    out.flush()?;
    Ok(())
}

pub fn read_export(path: &Path) -> Result<Vec<DbEntry>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Err(PandoError::InvalidDbFile(format!("{}: empty export file", path.display())));
    }
    // SAFETY: the mapping is read-only and dropped before returning; export
    // files are not rewritten while being imported.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(deserialize_entries(&mmap)?)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ParseState {
    NoEntry,
    Tags,
    Value,
}

/// Parse an ingestion text file into unkeyed entries.
pub fn parse_db_file(path: &Path) -> Result<Vec<DbEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    let mut state = ParseState::NoEntry;
    let mut current = DbEntry::default();

    for line in reader.lines() {
        let line = line?;
        match state {
            ParseState::NoEntry => {
                if line == "TAGS" {
                    state = ParseState::Tags;
                }
            }
            ParseState::Tags => {
                if line == "VALUE" {
                    state = ParseState::Value;
                } else {
                    current.add_tag(line);
                }
            }
            ParseState::Value => {
                if line == "END" {
                    entries.push(std::mem::take(&mut current));
                    state = ParseState::NoEntry;
                } else {
                    current.add_to_value(&line);
                }
            }
        }
    }

    if state != ParseState::NoEntry {
        return Err(PandoError::InvalidDbFile(format!(
            "{}: unterminated entry after {} complete entries",
            path.display(),
            entries.len()
        )));
    }
    Ok(entries)
}
