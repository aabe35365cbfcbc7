//! High-level encode/decode API: the primary embedding surface.
//!
//! ```no_run
//! use sngpkg::archive::{decode_file, encode_dir, DecodeOptions, EncodeOptions};
//! use std::path::Path;
//!
//! // Directory → archive (metadata from `My Song/song.ini`)
//! encode_dir(Path::new("My Song"), Path::new("My Song.sng"), &EncodeOptions::default())?;
//!
//! // Archive → "<artist> - <name> (<charter>)/" under the current directory
//! let dir = decode_file(Path::new("My Song.sng"), &DecodeOptions::default())?;
//! println!("decoded into {}", dir.display());
//! # Ok::<(), sngpkg::SngError>(())
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SngError};
use crate::header::{Header, DEFAULT_VERSION, HEADER_SIZE};
use crate::index::{validate_name, FileTable};
use crate::io_stream::{SngReader, SngSink, SngWriter, DEFAULT_CHUNK_SIZE};
use crate::mask::MaskKey;
use crate::metadata::Metadata;
use crate::scan::{is_conforming_name, layout_table, scan_dir, ScanOptions, SIDECAR_NAME};
use crate::sidecar::{read_sidecar, write_sidecar};
use crate::transcode::{CancelToken, TranscodeOptions, TranscodePool, TranscodeTask};

// ── EncodeOptions ─────────────────────────────────────────────────────────────

/// Configuration for [`encode_dir`] and [`encode_dir_to`].
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub version:             u32,
    /// Random per archive when unset.
    pub mask_key:            Option<MaskKey>,
    /// Read from the directory's `song.ini` when unset.
    pub metadata:            Option<Metadata>,
    pub allow_nonconforming: bool,
    pub overwrite:           bool,
    pub chunk_size:          usize,
    /// Convert audio assets with this transcoder.
    pub transcode:           Option<TranscodeOptions>,
    pub cancel:              CancelToken,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            version:             DEFAULT_VERSION,
            mask_key:            None,
            metadata:            None,
            allow_nonconforming: false,
            overwrite:           false,
            chunk_size:          DEFAULT_CHUNK_SIZE,
            transcode:           None,
            cancel:              CancelToken::new(),
        }
    }
}

/// What an encode produced.
#[derive(Debug, Clone)]
pub struct EncodeSummary {
    pub header:       Header,
    pub metadata:     Metadata,
    pub table:        FileTable,
    pub archive_size: u64,
}

// ── Encode ────────────────────────────────────────────────────────────────────

/// Encode `dir` into `sink`, returning the sink positioned at the end of
/// the archive.
///
/// On error the sink holds a partial archive and must be discarded.
pub fn encode_dir_to<S: SngSink>(dir: &Path, sink: S, opts: &EncodeOptions) -> Result<(S, EncodeSummary)> {
    if !dir.is_dir() {
        return Err(SngError::NotFound(dir.to_owned()));
    }
    let metadata = match &opts.metadata {
        Some(m) => m.clone(),
        None => read_sidecar(&dir.join(SIDECAR_NAME))?,
    };
    let header = Header::new(opts.version, opts.mask_key.unwrap_or_else(MaskKey::random));

    let scan_opts = ScanOptions {
        allow_nonconforming: opts.allow_nonconforming,
        transcode_to:        opts.transcode.as_ref().map(|t| t.transcoder.extension().to_owned()),
    };
    let files = scan_dir(dir, &scan_opts)?;
    let table = layout_table(&files, HEADER_SIZE + metadata.encoded_len());
    info!(dir = %dir.display(), files = files.len(), metadata = metadata.len(), "encoding");

    let mut writer = SngWriter::begin(sink, header.clone(), &metadata, table, opts.chunk_size)?;

    let tasks: Vec<TranscodeTask> = files
        .iter()
        .enumerate()
        .filter(|(_, f)| f.transcode)
        .map(|(index, f)| {
            let reserved_offset = writer
                .reserved_offset(index)
                .ok_or_else(|| SngError::format(format!("no file table slot for entry {index}")))?;
            Ok(TranscodeTask { index, source: f.path.clone(), reserved_offset })
        })
        .collect::<Result<_>>()?;
    let mut pool = match (&opts.transcode, tasks.is_empty()) {
        (Some(t), false) => Some(TranscodePool::start(tasks, t, opts.cancel.clone())?),
        _ => None,
    };

    for (index, file) in files.iter().enumerate() {
        if opts.cancel.is_cancelled() {
            warn!(committed = index, "encode cancelled");
            return Err(SngError::Cancelled);
        }
        if file.transcode {
            let pool = pool
                .as_mut()
                .ok_or_else(|| SngError::format(format!("no transcoder for {}", file.name)))?;
            let output = pool.wait_for(index)?;
            writer.commit_transcoded(output)?;
        } else {
            let mut source = File::open(&file.path)?;
            writer.commit_raw(index, &mut source)?;
        }
    }
    drop(pool);

    let (sink, table) = writer.finish()?;
    let archive_size =
        HEADER_SIZE + metadata.encoded_len() + table.encoded_len() + 8 + table.content_total()?;
    info!(entries = table.len(), archive_size, "encoded");
    Ok((sink, EncodeSummary { header, metadata, table, archive_size }))
}

/// Encode `dir` into the file at `dest`.
///
/// The archive is built in a temporary file next to `dest` and moved into
/// place only once complete, so a failed or cancelled encode leaves nothing
/// at `dest`.
pub fn encode_dir(dir: &Path, dest: &Path, opts: &EncodeOptions) -> Result<EncodeSummary> {
    if dest.exists() && !opts.overwrite {
        return Err(SngError::AlreadyExists(dest.to_owned()));
    }
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = tempfile::Builder::new()
        .prefix(".sng-")
        .suffix(".partial")
        .tempfile_in(parent)?;
    debug!(tmp = %tmp.path().display(), "staging archive");

    let (tmp, summary) = encode_dir_to(dir, tmp, opts)?;
    tmp.as_file().sync_all()?;

    let persisted = if opts.overwrite { tmp.persist(dest) } else { tmp.persist_noclobber(dest) };
    persisted.map_err(|e| match e.error.kind() {
        io::ErrorKind::AlreadyExists => SngError::AlreadyExists(dest.to_owned()),
        _ => SngError::Io(e.error),
    })?;
    info!(dest = %dest.display(), "wrote archive");
    Ok(summary)
}

/// Default output path: `<dir>.sng` next to the directory.
pub fn default_archive_path(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_else(|| "song".into());
    name.push(".sng");
    dir.with_file_name(name)
}

// ── DecodeOptions ─────────────────────────────────────────────────────────────

/// Configuration for [`decode_file`] and [`decode_reader`].
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub out_dir:             PathBuf,
    /// Name of the song directory under `out_dir`; derived from the
    /// metadata when unset.
    pub sng_dir:             Option<PathBuf>,
    pub overwrite:           bool,
    /// Skip entries outside the naming convention when false.
    pub allow_nonconforming: bool,
    /// Write `song.ini` from the metadata table.
    pub write_sidecar:       bool,
    pub chunk_size:          usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            out_dir:             PathBuf::from("."),
            sng_dir:             None,
            overwrite:           false,
            allow_nonconforming: true,
            write_sidecar:       true,
            chunk_size:          DEFAULT_CHUNK_SIZE,
        }
    }
}

/// `"{artist} - {name} ({charter})"`, with characters that cannot appear
/// in a directory name replaced by `_`.
pub fn song_dir_name(metadata: &Metadata) -> String {
    let field = |key: &str, fallback: &'static str| {
        metadata.get(key).map(str::trim).filter(|v| !v.is_empty()).unwrap_or(fallback).to_owned()
    };
    let name = format!(
        "{} - {} ({})",
        field("artist", "Unknown Artist"),
        field("name", "Unknown Song"),
        field("charter", "Unknown Charter"),
    );
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

// ── Decode ────────────────────────────────────────────────────────────────────

/// Open an archive on disk for inspection or random access.
pub fn open(path: &Path) -> Result<SngReader<BufReader<File>>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SngError::NotFound(path.to_owned()),
        _ => SngError::Io(e),
    })?;
    SngReader::new(BufReader::new(file))
}

/// Decode the archive at `path`; returns the song directory written.
pub fn decode_file(path: &Path, opts: &DecodeOptions) -> Result<PathBuf> {
    let reader = open(path)?;
    info!(path = %path.display(), "decoding");
    extract(reader, opts)
}

/// Decode an archive from any seekable source.
pub fn decode_reader<R: Read + Seek>(reader: R, opts: &DecodeOptions) -> Result<PathBuf> {
    extract(SngReader::new(reader)?, opts)
}

fn extract<R: Read + Seek>(reader: SngReader<R>, opts: &DecodeOptions) -> Result<PathBuf> {
    let mut reader = reader.with_chunk_size(opts.chunk_size);
    for entry in reader.entries() {
        validate_name(&entry.name)
            .map_err(|_| SngError::format(format!("unsafe entry name {:?}", entry.name)))?;
    }

    let dir_name = match &opts.sng_dir {
        Some(d) => d.clone(),
        None => PathBuf::from(song_dir_name(reader.metadata())),
    };
    let dest = opts.out_dir.join(dir_name);
    if dest.exists() && !opts.overwrite {
        return Err(SngError::AlreadyExists(dest));
    }

    fs::create_dir_all(&opts.out_dir)?;
    let staging = tempfile::Builder::new().prefix(".sng-").tempdir_in(&opts.out_dir)?;

    for index in 0..reader.entries().len() {
        let name = &reader.entries()[index].name;
        if !opts.allow_nonconforming && !is_conforming_name(name) {
            warn!(%name, "skipping entry outside the naming convention");
            continue;
        }
        if opts.write_sidecar && name.eq_ignore_ascii_case(SIDECAR_NAME) {
            debug!(%name, "entry replaced by the metadata table");
            continue;
        }
        reader.extract_entry(index, staging.path())?;
    }
    if opts.write_sidecar {
        write_sidecar(&staging.path().join(SIDECAR_NAME), reader.metadata())?;
    }

    if dest.is_dir() {
        fs::remove_dir_all(&dest)?;
    } else if dest.exists() {
        fs::remove_file(&dest)?;
    }
    fs::rename(staging.path(), &dest)?;
    // Nothing is left at the staging path; dropping it is a no-op.
    drop(staging);

    info!(dest = %dest.display(), "decoded");
    Ok(dest)
}

// ── Inspection ────────────────────────────────────────────────────────────────

/// Serializable summary used by `sng info`.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveInfo {
    pub version:        u32,
    pub mask_key:       String,
    pub metadata:       Metadata,
    pub files:          FileTable,
    pub content_length: u64,
}

impl ArchiveInfo {
    pub fn from_reader<R: Read + Seek>(reader: &SngReader<R>) -> Self {
        Self {
            version:        reader.header().version,
            mask_key:       reader.header().mask_key.to_hex(),
            metadata:       reader.metadata().clone(),
            files:          reader.table().clone(),
            content_length: reader.content_length(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_name_uses_defaults_and_sanitizes() {
        let m: Metadata = [("artist", "AC/DC"), ("name", "  ")].into_iter().collect();
        assert_eq!(song_dir_name(&m), "AC_DC - Unknown Song (Unknown Charter)");
    }

    #[test]
    fn default_archive_path_sits_next_to_dir() {
        assert_eq!(default_archive_path(Path::new("songs/My Song")), PathBuf::from("songs/My Song.sng"));
    }
}
