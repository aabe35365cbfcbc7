//! Bounded transcode worker pool with a single consuming coordinator.
//!
//! Workers run on a dedicated rayon pool.  Each one transcodes into a
//! scratch buffer it owns and hands the buffer back over a channel; no
//! worker ever sees the archive being written.  The coordinator (the
//! encode driver) pulls results with [`TranscodePool::wait_for`], which
//! buffers results that arrive before they are needed.
//!
//! Shutdown happens on the first failure, on cancellation, on a task
//! exceeding its deadline, or when the pool is dropped.  Queued tasks that
//! have not started yet see the shutdown flag and return without running;
//! results of tasks still in flight are discarded.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing::{debug, error, trace};

use super::{worker_count, CancelToken, TranscodeFailure, TranscodeOptions};
use crate::error::{Result, SngError};

/// How often the coordinator wakes up to look at the cancel flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One pending conversion tied to a reserved file-table slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeTask {
    /// Position of the entry in the file table.
    pub index:           usize,
    pub source:          PathBuf,
    /// Stream position of the entry's `(content_length, content_offset)` pair.
    pub reserved_offset: u64,
}

/// A finished conversion, owned by the coordinator from here on.
#[derive(Debug)]
pub struct TranscodeOutput {
    pub index:           usize,
    pub source:          PathBuf,
    pub reserved_offset: u64,
    pub buffer:          Vec<u8>,
}

enum Event {
    Started(usize, Instant),
    Finished(usize, std::result::Result<Vec<u8>, TranscodeFailure>),
}

pub struct TranscodePool {
    _pool:    rayon::ThreadPool,
    events:   Receiver<Event>,
    tasks:    HashMap<usize, TranscodeTask>,
    running:  HashMap<usize, Instant>,
    ready:    HashMap<usize, Vec<u8>>,
    cancel:   CancelToken,
    shutdown: CancelToken,
    timeout:  Option<Duration>,
}

impl TranscodePool {
    /// Submit every task.  Returns immediately; work starts in the background.
    pub fn start(tasks: Vec<TranscodeTask>, opts: &TranscodeOptions, cancel: CancelToken) -> Result<Self> {
        let threads = worker_count(opts.threads, tasks.len());
        debug!(threads, tasks = tasks.len(), "starting transcode pool");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sng-transcode-{i}"))
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let (tx, events) = unbounded();
        let shutdown = CancelToken::new();
        for task in &tasks {
            let tx = tx.clone();
            let transcoder = opts.transcoder.clone();
            let (cancel, shutdown) = (cancel.clone(), shutdown.clone());
            let (index, source) = (task.index, task.source.clone());
            trace!(index, source = %source.display(), "submitting transcode task");

            pool.spawn(move || {
                if cancel.is_cancelled() || shutdown.is_cancelled() {
                    return;
                }
                let _ = tx.send(Event::Started(index, Instant::now()));
                let mut scratch = Vec::new();
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    transcoder.transcode(&source, &mut scratch)
                }))
                .unwrap_or_else(|_| Err(TranscodeFailure::Codec("transcoder panicked".into())));
                // The receiver is gone once the coordinator has shut down.
                let _ = tx.send(Event::Finished(index, result.map(|()| scratch)));
            });
        }
        drop(tx);

        Ok(Self {
            _pool: pool,
            events,
            tasks: tasks.into_iter().map(|t| (t.index, t)).collect(),
            running: HashMap::new(),
            ready: HashMap::new(),
            cancel,
            shutdown,
            timeout: opts.task_timeout,
        })
    }

    /// Number of tasks not yet handed out.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Block until the task for table entry `index` has finished, buffering
    /// any other results that arrive first.
    pub fn wait_for(&mut self, index: usize) -> Result<TranscodeOutput> {
        if !self.tasks.contains_key(&index) {
            return Err(SngError::format(format!("no transcode task for entry {index}")));
        }
        loop {
            if let Some(buffer) = self.ready.remove(&index) {
                let task = self.tasks.remove(&index).ok_or(SngError::Cancelled)?;
                return Ok(TranscodeOutput {
                    index,
                    source: task.source,
                    reserved_offset: task.reserved_offset,
                    buffer,
                });
            }
            if self.cancel.is_cancelled() {
                error!("cancellation requested during transcoding");
                self.shutdown();
                return Err(SngError::Cancelled);
            }
            self.check_deadlines()?;

            match self.events.recv_timeout(self.next_wakeup()) {
                Ok(Event::Started(i, at)) => {
                    self.running.insert(i, at);
                }
                Ok(Event::Finished(i, Ok(buffer))) => {
                    self.running.remove(&i);
                    debug!(index = i, size = buffer.len(), "transcode finished");
                    self.ready.insert(i, buffer);
                }
                Ok(Event::Finished(i, Err(source))) => {
                    self.shutdown();
                    return Err(self.failure(i, source));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.shutdown();
                    return Err(self.failure(index, TranscodeFailure::WorkerLost));
                }
            }
        }
    }

    /// Stop queued tasks from starting.  Idempotent.
    pub fn shutdown(&mut self) {
        if !self.shutdown.is_cancelled() {
            debug!(discarded = self.tasks.len(), "shutting down transcode pool");
            self.shutdown.cancel();
            self.ready.clear();
        }
    }

    fn check_deadlines(&mut self) -> Result<()> {
        let Some(limit) = self.timeout else { return Ok(()) };
        let overdue = self
            .running
            .iter()
            .find(|(_, started)| started.elapsed() >= limit)
            .map(|(i, _)| *i);
        match overdue {
            Some(i) => {
                self.shutdown();
                Err(self.failure(i, TranscodeFailure::TimedOut(limit)))
            }
            None => Ok(()),
        }
    }

    fn next_wakeup(&self) -> Duration {
        let Some(limit) = self.timeout else { return POLL_INTERVAL };
        self.running
            .values()
            .map(|started| limit.saturating_sub(started.elapsed()))
            .min()
            .map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL))
    }

    fn failure(&self, index: usize, source: TranscodeFailure) -> SngError {
        let path = self.tasks.get(&index).map(|t| t.source.clone()).unwrap_or_default();
        error!(path = %path.display(), error = %source, "transcode failed");
        SngError::Transcode { path, source }
    }
}

impl Drop for TranscodePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
