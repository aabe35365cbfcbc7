//! Runs one encode or decode per input on a bounded pool.
//!
//! Every input is attempted; a failure is recorded against its input and
//! never stops the others.  Results come back in input order.

use std::io;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::debug;

use crate::error::Result;

#[derive(Debug)]
pub struct BatchResult<T> {
    pub input:   PathBuf,
    pub outcome: Result<T>,
}

/// Run `job` over `inputs` with at most `jobs` inputs in flight.
pub fn run_batch<T, F>(inputs: &[PathBuf], jobs: usize, job: F) -> Result<Vec<BatchResult<T>>>
where
    T: Send,
    F: Fn(&Path) -> Result<T> + Sync,
{
    let jobs = jobs.max(1).min(inputs.len().max(1));
    debug!(jobs, inputs = inputs.len(), "starting batch");
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .thread_name(|i| format!("sng-batch-{i}"))
        .build()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    Ok(pool.install(|| {
        inputs
            .par_iter()
            .map(|input| BatchResult { input: input.clone(), outcome: job(input) })
            .collect()
    }))
}
