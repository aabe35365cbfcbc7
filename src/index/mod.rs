//! File table: one record per stored file, in content order.
//!
//! Layout: `section_len (u64) | entry_count (u64) | { name_len (u8) | name | content_length (u64) | content_offset (u64) }*`
//!
//! `content_offset` is absolute from the start of the archive.  The
//! `(content_length, content_offset)` pair of each record is the slot the
//! encoder reserves and later back-patches, so its position in the stream
//! is exposed through [`FileTable::reserved_offsets`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{Result, SngError};
use crate::header::truncated;
use crate::metadata::read_vec;

pub const MAX_NAME_LEN: usize = 255;
/// name_len (1) + content_length (8) + content_offset (8)
pub const ENTRY_FIXED_LEN: u64 = 17;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name:           String,
    pub content_length: u64,
    pub content_offset: u64,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, content_length: u64, content_offset: u64) -> Self {
        Self { name: name.into(), content_length, content_offset }
    }

    pub fn encoded_len(&self) -> u64 {
        ENTRY_FIXED_LEN + self.name.len() as u64
    }

    /// Position one past the last payload byte.
    pub fn content_end(&self) -> u64 {
        self.content_offset + self.content_length
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileTable {
    pub entries: Vec<FileEntry>,
}

impl FileTable {
    pub fn new(entries: Vec<FileEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileEntry> {
        self.entries.iter()
    }

    pub fn get(&self, name: &str) -> Option<&FileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Value of the `section_len` field: entry count plus all records.
    pub fn section_len(&self) -> u64 {
        8 + self.entries.iter().map(FileEntry::encoded_len).sum::<u64>()
    }

    /// Bytes occupied on disk, including the `section_len` field itself.
    pub fn encoded_len(&self) -> u64 {
        8 + self.section_len()
    }

    /// Sum of all `content_length` fields.  A table read from an archive
    /// can declare lengths whose sum does not fit in a `u64`.
    pub fn content_total(&self) -> Result<u64> {
        self.entries.iter().try_fold(0u64, |total, e| {
            total
                .checked_add(e.content_length)
                .ok_or_else(|| SngError::format(format!("content length overflows at {}", e.name)))
        })
    }

    /// Absolute position of each record's `content_length` field when the
    /// table is written starting at `table_start`.
    pub fn reserved_offsets(&self, table_start: u64) -> Vec<u64> {
        let mut pos = table_start + 16;
        self.entries
            .iter()
            .map(|e| {
                let reserved = pos + 1 + e.name.len() as u64;
                pos += e.encoded_len();
                reserved
            })
            .collect()
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u64::<LittleEndian>(self.section_len())?;
        writer.write_u64::<LittleEndian>(self.entries.len() as u64)?;
        for entry in &self.entries {
            validate_name(&entry.name)?;
            writer.write_u8(entry.name.len() as u8)?;
            writer.write_all(entry.name.as_bytes())?;
            writer.write_u64::<LittleEndian>(entry.content_length)?;
            writer.write_u64::<LittleEndian>(entry.content_offset)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let declared = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| truncated(e, "file table length"))?;
        let count = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| truncated(e, "file count"))?;
        let mut consumed = 8u64;

        let mut entries = Vec::new();
        for _ in 0..count {
            if consumed + 1 > declared {
                return Err(SngError::SizeMismatch { section: "file table", declared, actual: consumed + 1 });
            }
            let name_len = reader.read_u8().map_err(|e| truncated(e, "file name length"))? as u64;
            let record_len = ENTRY_FIXED_LEN + name_len;
            if consumed + record_len > declared {
                return Err(SngError::SizeMismatch {
                    section: "file table",
                    declared,
                    actual: consumed + record_len,
                });
            }
            let name = String::from_utf8(read_vec(&mut reader, name_len, "file name")?)
                .map_err(|_| SngError::format("file name is not valid UTF-8"))?;
            let content_length = reader
                .read_u64::<LittleEndian>()
                .map_err(|e| truncated(e, "content length"))?;
            let content_offset = reader
                .read_u64::<LittleEndian>()
                .map_err(|e| truncated(e, "content offset"))?;
            consumed += record_len;
            tracing::debug!(%name, content_length, content_offset, "file table entry");
            entries.push(FileEntry { name, content_length, content_offset });
        }

        if consumed != declared {
            return Err(SngError::SizeMismatch { section: "file table", declared, actual: consumed });
        }
        Ok(Self { entries })
    }

    /// Check that payloads are packed back to back starting at `content_start`.
    pub fn check_layout(&self, content_start: u64) -> Result<()> {
        let mut expected = content_start;
        for entry in &self.entries {
            if entry.content_offset != expected {
                return Err(SngError::format(format!(
                    "{} starts at offset {}, expected {}",
                    entry.name, entry.content_offset, expected
                )));
            }
            expected = expected
                .checked_add(entry.content_length)
                .ok_or_else(|| SngError::format(format!("{} length overflows", entry.name)))?;
        }
        Ok(())
    }
}

/// Names are stored as bare file names: 1..=255 bytes, no path components.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "empty"
    } else if name.len() > MAX_NAME_LEN {
        "longer than 255 bytes"
    } else if name.contains(['/', '\\']) || name == "." || name == ".." {
        "not a plain file name"
    } else {
        return Ok(());
    };
    Err(SngError::InvalidName { name: name.to_owned(), reason })
}

/// Overwrite the reserved `(content_length, content_offset)` pair at
/// `reserved_offset`.  Leaves the cursor just after the pair.
pub fn patch_entry<W: Write + Seek>(
    writer:          &mut W,
    reserved_offset: u64,
    content_length:  u64,
    content_offset:  u64,
) -> io::Result<()> {
    writer.seek(SeekFrom::Start(reserved_offset))?;
    writer.write_u64::<LittleEndian>(content_length)?;
    writer.write_u64::<LittleEndian>(content_offset)?;
    Ok(())
}
