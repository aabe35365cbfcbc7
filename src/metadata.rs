//! Ordered string table stored right after the header.
//!
//! Layout: `section_len (u64) | entry_count (u64) | { key_len (u32) | key | value_len (u32) | value }*`
//! where `section_len` counts everything after itself: the entry count and
//! all entries.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Serialize, Serializer};
use std::io::{Read, Write};

use crate::error::{Result, SngError};
use crate::header::truncated;

/// Key/value metadata with unique keys kept in insertion order.
///
/// Inserting an existing key replaces its value in place; the key keeps the
/// position of its first insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous value when `key` was already present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Value of the `section_len` field.
    pub fn section_len(&self) -> u64 {
        8 + self
            .entries
            .iter()
            .map(|(k, v)| 4 + k.len() as u64 + 4 + v.len() as u64)
            .sum::<u64>()
    }

    /// Bytes occupied on disk, including the `section_len` field itself.
    pub fn encoded_len(&self) -> u64 {
        8 + self.section_len()
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_u64::<LittleEndian>(self.section_len())?;
        writer.write_u64::<LittleEndian>(self.entries.len() as u64)?;
        for (key, value) in &self.entries {
            write_string(&mut writer, key)?;
            write_string(&mut writer, value)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let declared = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| truncated(e, "metadata length"))?;
        let count = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| truncated(e, "metadata count"))?;
        let mut consumed = 8u64;

        let mut metadata = Metadata::new();
        for _ in 0..count {
            let key = read_string(&mut reader, declared, &mut consumed)?;
            let value = read_string(&mut reader, declared, &mut consumed)?;
            tracing::trace!(%key, %value, "metadata entry");
            metadata.insert(key, value);
        }

        if consumed != declared {
            return Err(SngError::SizeMismatch { section: "metadata", declared, actual: consumed });
        }
        if metadata.len() as u64 != count {
            return Err(SngError::SizeMismatch {
                section:  "metadata entry count",
                declared: count,
                actual:   metadata.len() as u64,
            });
        }
        Ok(metadata)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    let len = u32::try_from(s.len())
        .map_err(|_| SngError::format(format!("metadata string of {} bytes is too long", s.len())))?;
    writer.write_u32::<LittleEndian>(len)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

/// Reads one `u32`-prefixed string, refusing to run past the declared section.
fn read_string<R: Read>(reader: &mut R, declared: u64, consumed: &mut u64) -> Result<String> {
    if *consumed + 4 > declared {
        return Err(SngError::SizeMismatch { section: "metadata", declared, actual: *consumed + 4 });
    }
    let len = reader
        .read_u32::<LittleEndian>()
        .map_err(|e| truncated(e, "metadata string length"))? as u64;
    *consumed += 4;
    if *consumed + len > declared {
        return Err(SngError::SizeMismatch { section: "metadata", declared, actual: *consumed + len });
    }
    let bytes = read_vec(reader, len, "metadata string")?;
    *consumed += len;
    String::from_utf8(bytes).map_err(|_| SngError::format("metadata string is not valid UTF-8"))
}

/// Read exactly `len` bytes without trusting `len` for the allocation up front.
pub(crate) fn read_vec<R: Read>(reader: &mut R, len: u64, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(SngError::format(format!("truncated while reading {what}")));
    }
    Ok(buf)
}
