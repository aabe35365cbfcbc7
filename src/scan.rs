//! Source directory enumeration and provisional content layout.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SngError};
use crate::index::{validate_name, FileEntry, FileTable};

/// Name of the sidecar metadata descriptor inside a song directory.
pub const SIDECAR_NAME: &str = "song.ini";
/// Files never stored as entries.
pub const RESERVED_NAMES: &[&str] = &[SIDECAR_NAME];

const CHART_NAMES: &[&str] = &["notes.chart", "notes.mid"];
const IMAGE_STEMS: &[&str] = &["album", "background", "highway"];
const IMAGE_EXTS:  &[&str] = &["png", "jpg", "jpeg"];
const VIDEO_EXTS:  &[&str] = &["mp4", "avi", "webm", "vp8", "ogv", "mpeg"];
const AUDIO_STEMS: &[&str] = &[
    "guitar", "bass", "rhythm", "vocals", "vocals_1", "vocals_2", "drums", "drums_1", "drums_2",
    "drums_3", "drums_4", "keys", "song", "crowd", "preview",
];
const AUDIO_EXTS:  &[&str] = &["wav", "ogg", "mp3", "opus", "flac"];

fn split_name(name: &str) -> Option<(String, String)> {
    let (stem, ext) = name.rsplit_once('.')?;
    Some((stem.to_ascii_lowercase(), ext.to_ascii_lowercase()))
}

/// Whether `name` follows the song-folder asset naming convention.
pub fn is_conforming_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if CHART_NAMES.contains(&lower.as_str()) {
        return true;
    }
    let Some((stem, ext)) = split_name(name) else { return false };
    let (stem, ext) = (stem.as_str(), ext.as_str());
    (IMAGE_STEMS.contains(&stem) && IMAGE_EXTS.contains(&ext))
        || (stem == "video" && VIDEO_EXTS.contains(&ext))
        || (AUDIO_STEMS.contains(&stem) && AUDIO_EXTS.contains(&ext))
}

pub fn is_audio_name(name: &str) -> bool {
    split_name(name).is_some_and(|(_, ext)| AUDIO_EXTS.contains(&ext.as_str()))
}

fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name))
}

/// One accepted source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path:      PathBuf,
    /// Name stored in the file table.  Differs from the source name for
    /// transcoded entries.
    pub name:      String,
    /// Raw size on disk; only a placeholder for transcoded entries.
    pub size:      u64,
    pub transcode: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Include files outside the naming convention (with a warning)
    /// instead of skipping them.
    pub allow_nonconforming: bool,
    /// Extension that audio files are transcoded to, when transcoding.
    pub transcode_to:        Option<String>,
}

/// Enumerate the regular files directly inside `dir`, sorted by name.
pub fn scan_dir(dir: &Path, opts: &ScanOptions) -> Result<Vec<SourceFile>> {
    if !dir.is_dir() {
        return Err(SngError::NotFound(dir.to_owned()));
    }

    let mut files = Vec::new();
    let mut seen = HashSet::new();
    let walker = WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(true).sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let source_name = file_name.to_str().ok_or_else(|| SngError::InvalidName {
            name:   file_name.to_string_lossy().into_owned(),
            reason: "not valid UTF-8",
        })?;

        if is_reserved(source_name) {
            debug!(name = source_name, "skipping reserved file");
            continue;
        }
        if !is_conforming_name(source_name) {
            if opts.allow_nonconforming {
                warn!(name = source_name, "including file outside the naming convention");
            } else {
                info!(name = source_name, "skipping file outside the naming convention");
                continue;
            }
        }

        let mut name = source_name.to_owned();
        let mut transcode = false;
        if let Some(target) = &opts.transcode_to {
            if let Some((stem, ext)) = source_name.rsplit_once('.') {
                if is_audio_name(source_name) && !ext.eq_ignore_ascii_case(target) {
                    name = format!("{stem}.{target}");
                    transcode = true;
                }
            }
        }

        validate_name(&name)?;
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(SngError::InvalidName { name, reason: "duplicate entry name" });
        }

        let size = entry.metadata().map_err(io::Error::from)?.len();
        debug!(%name, size, transcode, "accepted source file");
        files.push(SourceFile { path: entry.into_path(), name, size, transcode });
    }
    Ok(files)
}

/// Build the provisional file table for `files` written at `table_start`.
///
/// Offsets run from the first payload byte, which follows the table and
/// the 8-byte total content length, and advance by each raw size.
pub fn layout_table(files: &[SourceFile], table_start: u64) -> FileTable {
    let mut table = FileTable::new(
        files.iter().map(|f| FileEntry::new(f.name.clone(), f.size, 0)).collect(),
    );
    let mut offset = table_start + table.encoded_len() + 8;
    for entry in &mut table.entries {
        entry.content_offset = offset;
        offset += entry.content_length;
    }
    table
}
