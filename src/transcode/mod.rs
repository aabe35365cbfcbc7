//! Audio transcoding seam.
//!
//! The archive code never decodes audio itself.  A [`Transcoder`] turns a
//! source file into a compressed stream written to a caller-owned sink;
//! [`pool::TranscodePool`] runs many of them concurrently.
//!
//! # Thread safety
//! `transcode` is called from several pool threads at once, each with its
//! own sink.  Implementations must not rely on shared mutable state.

pub mod pool;

use std::ffi::OsString;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use pool::{TranscodeOutput, TranscodePool, TranscodeTask};

/// Argument replaced by the source path in [`CommandTranscoder`] templates.
pub const INPUT_PLACEHOLDER: &str = "{input}";
/// Default per-task deadline.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum TranscodeFailure {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{program} exited with {status}: {stderr}")]
    Process {
        program: String,
        status:  ExitStatus,
        stderr:  String,
    },
    #[error("{0}")]
    Codec(String),
    #[error("no result within {0:?}")]
    TimedOut(Duration),
    #[error("worker stopped without reporting a result")]
    WorkerLost,
}

pub trait Transcoder: Send + Sync {
    /// Extension (without the dot) of the produced stream, e.g. `"opus"`.
    fn extension(&self) -> &str;

    fn transcode(&self, source: &Path, sink: &mut dyn Write) -> Result<(), TranscodeFailure>;
}

/// Runs an external encoder and captures its stdout.
#[derive(Debug, Clone)]
pub struct CommandTranscoder {
    program:   PathBuf,
    args:      Vec<String>,
    extension: String,
}

impl CommandTranscoder {
    /// `args` may contain [`INPUT_PLACEHOLDER`] as a whole argument.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, extension: impl Into<String>) -> Self {
        Self { program: program.into(), args, extension: extension.into() }
    }

    /// `ffmpeg` encoding to Opus in an Ogg container.
    pub fn ffmpeg_opus(program: impl Into<PathBuf>) -> Self {
        let args = [
            "-nostdin", "-loglevel", "error", "-i", INPUT_PLACEHOLDER, "-vn", "-c:a", "libopus",
            "-b:a", "80k", "-f", "ogg", "pipe:1",
        ];
        Self::new(program, args.iter().map(|s| s.to_string()).collect(), "opus")
    }
}

impl Transcoder for CommandTranscoder {
    fn extension(&self) -> &str {
        &self.extension
    }

    fn transcode(&self, source: &Path, sink: &mut dyn Write) -> Result<(), TranscodeFailure> {
        let args = self.args.iter().map(|a| {
            if a == INPUT_PLACEHOLDER { source.as_os_str().to_owned() } else { OsString::from(a) }
        });
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(TranscodeFailure::Process {
                program: self.program.display().to_string(),
                status:  output.status,
                stderr:  String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        sink.write_all(&output.stdout)?;
        Ok(())
    }
}

/// Cooperative cancellation flag shared between the caller and a running
/// encode.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct TranscodeOptions {
    pub transcoder:   Arc<dyn Transcoder>,
    /// Worker count; defaults to a quarter of the available parallelism.
    pub threads:      Option<usize>,
    /// Longest a single task may run.  `None` waits forever.
    pub task_timeout: Option<Duration>,
}

impl TranscodeOptions {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self { transcoder, threads: None, task_timeout: Some(DEFAULT_TASK_TIMEOUT) }
    }
}

impl fmt::Debug for TranscodeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeOptions")
            .field("extension", &self.transcoder.extension())
            .field("threads", &self.threads)
            .field("task_timeout", &self.task_timeout)
            .finish()
    }
}

/// Pool size for `tasks` units of work: `requested`, or a quarter of the
/// machine, never below 1 and never above `tasks`.
pub fn worker_count(requested: Option<usize>, tasks: usize) -> usize {
    let wanted = requested.unwrap_or_else(|| {
        std::thread::available_parallelism().map(|n| n.get() / 4).unwrap_or(1)
    });
    wanted.max(1).min(tasks.max(1))
}
