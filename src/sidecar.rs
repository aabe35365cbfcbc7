//! `song.ini` descriptor: the human-editable source and sink of the
//! metadata table.  Only the `[Song]` section is read or written.

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{Result, SngError};
use crate::metadata::Metadata;

pub const SECTION: &str = "Song";

/// Parse the `[Song]` section.  Keys are lower-cased; later duplicates win.
pub fn parse(text: &str) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    let mut in_song = false;
    let mut found = false;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .ok_or_else(|| SngError::format(format!("song.ini line {}: unterminated section", lineno + 1)))?;
            in_song = name.trim().eq_ignore_ascii_case(SECTION);
            found |= in_song;
            continue;
        }
        if !in_song {
            continue;
        }
        let split = line
            .find(['=', ':'])
            .ok_or_else(|| SngError::format(format!("song.ini line {}: expected key = value", lineno + 1)))?;
        let (key, value) = (&line[..split], &line[split + 1..]);
        metadata.insert(key.trim().to_lowercase(), value.trim());
    }

    if !found {
        return Err(SngError::format("song.ini has no [Song] section"));
    }
    Ok(metadata)
}

pub fn render(metadata: &Metadata) -> String {
    let mut out = format!("[{SECTION}]\n");
    for (key, value) in metadata.iter() {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
    out.push('\n');
    out
}

pub fn read_sidecar(path: &Path) -> Result<Metadata> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SngError::NotFound(path.to_owned()),
        _ => SngError::Io(e),
    })?;
    parse(&text)
}

pub fn write_sidecar(path: &Path, metadata: &Metadata) -> Result<()> {
    fs::write(path, render(metadata))?;
    Ok(())
}
