pub mod error;
pub mod mask;
pub mod header;
pub mod metadata;
pub mod index;
pub mod scan;
pub mod sidecar;
pub mod io_stream;
pub mod transcode;
pub mod archive;
pub mod batch;

pub use error::{Result, SngError};
pub use mask::{mask, MaskKey};
pub use header::Header;
pub use metadata::Metadata;
pub use index::{FileEntry, FileTable};
pub use io_stream::{SngReader, SngSink, SngWriter};
pub use transcode::{CancelToken, CommandTranscoder, TranscodeFailure, TranscodeOptions, Transcoder};
pub use archive::{decode_file, encode_dir, DecodeOptions, EncodeOptions};
