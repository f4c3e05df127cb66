use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::info;

use shadowmask_cli::{expand_inputs, resolve_config, run_batch, worker_backends, Overrides};
use shadowmask_core::{GpuContext, HostBackend};

pub fn cmd_batch(
    inputs: Vec<PathBuf>,
    out: Option<PathBuf>,
    threads: Option<usize>,
    overrides: Overrides,
    cpu_only: bool,
) -> Result<()> {
    let batch_start = Instant::now();

    if inputs.is_empty() {
        bail!("no input files or directories specified");
    }
    let inputs = expand_inputs(&inputs)?;
    if inputs.is_empty() {
        bail!("no supported image files found");
    }

    if let Some(dir) = &out {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let config = resolve_config(&overrides);

    let mut builder = rayon::ThreadPoolBuilder::new();
    if let Some(n) = threads {
        builder = builder.num_threads(n);
    }
    let pool = builder.build().context("failed to build thread pool")?;
    info!(files = inputs.len(), threads = pool.current_num_threads(), "starting batch");

    let report = if cpu_only {
        let backends = worker_backends(&pool, || Ok::<_, String>(HostBackend::new()))?;
        run_batch(&pool, &backends, &inputs, out.as_deref(), &config)
    } else {
        // Compile once up front so the workers all load the persisted binary.
        let warm = GpuContext::from_options(&config.accelerator)?;
        info!(origin = ?warm.program_origin(), "program cache ready");
        drop(warm);

        let contexts = worker_backends(&pool, || GpuContext::from_options(&config.accelerator))?;
        run_batch(&pool, &contexts, &inputs, out.as_deref(), &config)
    };

    println!(
        "Processed {} of {} file(s) in {:.2}s",
        report.succeeded(),
        report.total,
        batch_start.elapsed().as_secs_f64()
    );

    if !report.failures.is_empty() {
        for (path, reason) in &report.failures {
            eprintln!("  {}: {}", path.display(), reason);
        }
        bail!("{} file(s) failed", report.failures.len());
    }
    Ok(())
}
