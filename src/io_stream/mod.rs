//! Streaming archive engine: writer and reader.
//!
//! # Writer
//! [`SngWriter`] writes the header, metadata table and a provisional file
//! table up front, followed by a provisional total content length.  Entries
//! are then committed one at a time in table order: the payload is streamed
//! through the mask in bounded chunks, and when its real size or offset
//! differs from the provisional one (always the case for transcoded
//! entries) the entry's reserved slot in the file table is back-patched.
//! The stream is truncated at the write cursor after every commit.
//! `finish()` patches the total content length.
//!
//! # Reader
//! [`SngReader`] parses and validates every table before touching any
//! payload: declared section lengths, the total content length against the
//! file table, contiguous offsets, and that the stream is long enough.
//!
//! # Endianness
//! All integers are little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{Result, SngError};
use crate::header::{truncated, Header, HEADER_SIZE};
use crate::index::{patch_entry, validate_name, FileEntry, FileTable};
use crate::mask::{MaskKey, Masker};
use crate::metadata::Metadata;
use crate::transcode::TranscodeOutput;

/// Default streaming chunk: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

// ── Sink ─────────────────────────────────────────────────────────────────────

/// Seekable output an archive can be written to.
pub trait SngSink: Write + Seek {
    /// Drop everything past `len`.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl SngSink for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl SngSink for tempfile::NamedTempFile {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.as_file().set_len(len)
    }
}

impl SngSink for Cursor<Vec<u8>> {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

impl<S: SngSink + ?Sized> SngSink for &mut S {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        (**self).truncate_to(len)
    }
}

/// Stream `reader` into `writer`, masking with payload positions starting
/// at 0.  Returns the number of bytes copied.
pub fn copy_masked<R, W>(reader: &mut R, writer: &mut W, key: MaskKey, chunk_size: usize) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut masker = Masker::new(key);
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        masker.apply(&mut buf[..n]);
        writer.write_all(&buf[..n])?;
    }
    Ok(masker.position())
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct SngWriter<S: SngSink> {
    sink:          S,
    header:        Header,
    table:         FileTable,
    reserved:      Vec<u64>,
    prefix_offset: u64,
    content_start: u64,
    cursor:        u64,
    committed:     usize,
    chunk_size:    usize,
}

impl<S: SngSink> SngWriter<S> {
    /// Write everything up to the first payload byte.  `table` must already
    /// be laid out from the position right after its own content prefix.
    pub fn begin(mut sink: S, header: Header, metadata: &Metadata, table: FileTable, chunk_size: usize) -> Result<Self> {
        sink.seek(SeekFrom::Start(0))?;
        header.write(&mut sink)?;
        metadata.write(&mut sink)?;
        let table_start = HEADER_SIZE + metadata.encoded_len();
        table.write(&mut sink)?;
        let prefix_offset = table_start + table.encoded_len();
        sink.write_u64::<LittleEndian>(table.content_total()?)?;
        let content_start = sink.stream_position()?;
        sink.truncate_to(content_start)?;
        if content_start != prefix_offset + 8 {
            return Err(SngError::format(format!(
                "header and tables ended at {content_start}, expected {}",
                prefix_offset + 8
            )));
        }
        table.check_layout(content_start)?;
        debug!(entries = table.len(), content_start, "wrote provisional tables");

        let reserved = table.reserved_offsets(table_start);
        Ok(Self {
            sink,
            header,
            table,
            reserved,
            prefix_offset,
            content_start,
            cursor: content_start,
            committed: 0,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn table(&self) -> &FileTable {
        &self.table
    }

    /// Stream position of entry `index`'s `(content_length, content_offset)` pair.
    pub fn reserved_offset(&self, index: usize) -> Option<u64> {
        self.reserved.get(index).copied()
    }

    /// Index of the next entry to commit.
    pub fn next_index(&self) -> usize {
        self.committed
    }

    /// Commit an entry whose bytes come straight from `reader`.
    pub fn commit_raw<R: Read + ?Sized>(&mut self, index: usize, reader: &mut R) -> Result<u64> {
        let reserved = self.reserved_offset(index).ok_or_else(|| no_entry(index))?;
        self.commit(index, reserved, reader)
    }

    /// Commit a finished transcode into the slot it was reserved for.
    pub fn commit_transcoded(&mut self, output: TranscodeOutput) -> Result<u64> {
        let size = self.commit(output.index, output.reserved_offset, &mut output.buffer.as_slice())?;
        debug!(source = %output.source.display(), size, "committed transcoded entry");
        Ok(size)
    }

    fn commit<R: Read + ?Sized>(&mut self, index: usize, reserved_offset: u64, reader: &mut R) -> Result<u64> {
        if index != self.committed {
            return Err(SngError::format(format!(
                "entry {index} committed out of order, expected {}",
                self.committed
            )));
        }
        if self.reserved.get(index) != Some(&reserved_offset) {
            return Err(SngError::format(format!("entry {index} does not own slot {reserved_offset}")));
        }

        let before = self.sink.seek(SeekFrom::Start(self.cursor))?;
        copy_masked(reader, &mut self.sink, self.header.mask_key, self.chunk_size)?;
        let after = self.sink.stream_position()?;
        let size = after - before;

        let entry = &mut self.table.entries[index];
        if entry.content_length != size || entry.content_offset != before {
            trace!(
                name = %entry.name,
                provisional_length = entry.content_length,
                provisional_offset = entry.content_offset,
                size,
                offset = before,
                "patching reserved slot"
            );
            patch_entry(&mut self.sink, reserved_offset, size, before)?;
            self.sink.seek(SeekFrom::Start(after))?;
            entry.content_length = size;
            entry.content_offset = before;
        }
        self.sink.truncate_to(after)?;

        trace!(name = %entry.name, size, offset = before, "committed entry");
        self.cursor = after;
        self.committed += 1;
        Ok(size)
    }

    /// Patch the total content length and hand the sink back with the final table.
    pub fn finish(mut self) -> Result<(S, FileTable)> {
        if self.committed != self.table.len() {
            return Err(SngError::format(format!(
                "only {} of {} entries were written",
                self.committed,
                self.table.len()
            )));
        }
        let total = self.table.content_total()?;
        let written = self.cursor - self.content_start;
        if total != written {
            return Err(SngError::SizeMismatch { section: "content", declared: total, actual: written });
        }
        self.sink.seek(SeekFrom::Start(self.prefix_offset))?;
        self.sink.write_u64::<LittleEndian>(total)?;
        self.sink.seek(SeekFrom::Start(self.cursor))?;
        self.sink.flush()?;
        debug!(total, archive_size = self.cursor, "finished archive");
        Ok((self.sink, self.table))
    }
}

fn no_entry(index: usize) -> SngError {
    SngError::format(format!("no file table entry {index}"))
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct SngReader<R: Read + Seek> {
    reader:         R,
    header:         Header,
    metadata:       Metadata,
    table:          FileTable,
    content_start:  u64,
    content_length: u64,
    chunk_size:     usize,
}

impl<R: Read + Seek> SngReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let header = Header::read(&mut reader)?;
        let metadata = Metadata::read(&mut reader)?;
        let table = FileTable::read(&mut reader)?;

        let declared = reader
            .read_u64::<LittleEndian>()
            .map_err(|e| truncated(e, "content length"))?;
        let content_start = reader.stream_position()?;
        table.check_layout(content_start)?;
        let listed = table.content_total()?;
        if declared != listed {
            return Err(SngError::SizeMismatch { section: "content", declared, actual: listed });
        }

        let end = reader.seek(SeekFrom::End(0))?;
        let available = end.saturating_sub(content_start);
        if available < declared {
            return Err(SngError::SizeMismatch { section: "content", declared, actual: available });
        }
        reader.seek(SeekFrom::Start(content_start))?;

        debug!(
            version = header.version,
            metadata = metadata.len(),
            entries = table.len(),
            "opened archive"
        );
        Ok(Self {
            reader,
            header,
            metadata,
            table,
            content_start,
            content_length: declared,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn table(&self) -> &FileTable {
        &self.table
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.table.entries
    }

    /// Validated total of all payload lengths.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Position of the first payload byte.
    pub fn content_start(&self) -> u64 {
        self.content_start
    }

    /// Stream entry `index` unmasked into `writer`.
    pub fn copy_entry<W: Write + ?Sized>(&mut self, index: usize, writer: &mut W) -> Result<u64> {
        let entry = self.table.entries.get(index).ok_or_else(|| no_entry(index))?;
        let (offset, length) = (entry.content_offset, entry.content_length);
        self.reader.seek(SeekFrom::Start(offset))?;
        let copied = copy_masked(
            &mut (&mut self.reader).take(length),
            writer,
            self.header.mask_key,
            self.chunk_size,
        )?;
        if copied != length {
            return Err(SngError::SizeMismatch { section: "file content", declared: length, actual: copied });
        }
        Ok(copied)
    }

    /// Random access to one entry by name.
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let index = self
            .table
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| SngError::NotFound(PathBuf::from(name)))?;
        let mut out = Vec::with_capacity(self.table.entries[index].content_length.min(1 << 24) as usize);
        self.copy_entry(index, &mut out)?;
        Ok(out)
    }

    /// Materialize entry `index` as `dir/<name>`.
    pub fn extract_entry(&mut self, index: usize, dir: &Path) -> Result<PathBuf> {
        let name = &self.table.entries.get(index).ok_or_else(|| no_entry(index))?.name;
        validate_name(name).map_err(|_| SngError::format(format!("unsafe entry name {name:?}")))?;
        let path = dir.join(name);
        let mut out = io::BufWriter::new(File::create(&path)?);
        self.copy_entry(index, &mut out)?;
        out.flush()?;
        trace!(path = %path.display(), "extracted entry");
        Ok(path)
    }

    /// Extract every entry into `dest`, creating it if necessary.
    pub fn extract_all(&mut self, dest: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dest)?;
        (0..self.table.len()).map(|i| self.extract_entry(i, dest)).collect()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
