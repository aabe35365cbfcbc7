use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::transcode::TranscodeFailure;

/// Every failure an encode or decode can surface.  None of them are retried.
#[derive(Error, Debug)]
pub enum SngError {
    /// Wrong identifier, or a section that cannot be parsed structurally.
    #[error("Invalid SNG data: {0}")]
    Format(String),

    /// A declared length disagrees with the bytes actually consumed or produced.
    #[error("{section} size mismatch: declared {declared}, found {actual}")]
    SizeMismatch {
        section:  &'static str,
        declared: u64,
        actual:   u64,
    },

    #[error("Destination already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Cannot store file name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Transcoding {} failed: {source}", .path.display())]
    Transcode {
        path:   PathBuf,
        #[source]
        source: TranscodeFailure,
    },

    #[error("Encode cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SngError>;

impl SngError {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        SngError::Format(msg.into())
    }
}
