//! Parallel detection over many files, one backend per pool worker.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{error, info};

use shadowmask_core::{ComputeBackend, ShadowmaskConfig};

use crate::processing::{detect_file, determine_output_path};

/// Outcome of a batch run.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    /// Inputs that failed, with the error chain rendered as text.
    pub failures: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.total - self.failures.len()
    }
}

/// Create one backend on every worker thread of `pool`.
///
/// The result is indexed by worker, so each thread only ever touches its own
/// backend. Any worker failing to create one fails the whole call.
pub fn worker_backends<B, F, E>(pool: &ThreadPool, make: F) -> Result<Vec<B>>
where
    B: Send,
    F: Fn() -> Result<B, E> + Sync,
    E: std::fmt::Display + Send,
{
    pool.broadcast(|ctx| make().map_err(|err| (ctx.index(), err)))
        .into_iter()
        .map(|made| made.map_err(|(index, err)| anyhow!("worker {}: {}", index, err)))
        .collect()
}

/// Detect shadows in every input on `pool`, continuing past failures.
///
/// `backends` holds one backend per pool worker, as built by [`worker_backends`].
pub fn run_batch<B>(
    pool: &ThreadPool,
    backends: &[B],
    inputs: &[PathBuf],
    out: Option<&Path>,
    config: &ShadowmaskConfig,
) -> BatchReport
where
    B: ComputeBackend + Sync,
{
    let processed = AtomicUsize::new(0);
    let total = inputs.len();

    let failures = pool.install(|| {
        inputs
            .par_iter()
            .filter_map(|input| {
                let result = rayon::current_thread_index()
                    .and_then(|index| backends.get(index))
                    .ok_or_else(|| anyhow!("no backend for this worker"))
                    .and_then(|backend| {
                        let output = determine_output_path(input, out)?;
                        detect_file(backend, input, &output, config)
                    });

                let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                match result {
                    Ok(shadow_pixels) => {
                        info!(done, total, input = %input.display(), shadow_pixels, "processed");
                        None
                    }
                    Err(err) => {
                        error!(done, total, input = %input.display(), "{:#}", err);
                        Some((input.clone(), format!("{:#}", err)))
                    }
                }
            })
            .collect()
    });

    BatchReport { total, failures }
}
