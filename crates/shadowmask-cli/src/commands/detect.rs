use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use tracing::info;

use shadowmask_cli::{determine_output_path, detect_file, resolve_config, Overrides};
use shadowmask_core::{GpuContext, HostBackend};

pub fn cmd_detect(
    input: PathBuf,
    out: Option<PathBuf>,
    overrides: Overrides,
    cpu_only: bool,
) -> Result<()> {
    let start = Instant::now();
    let config = resolve_config(&overrides);
    let output = determine_output_path(&input, out.as_deref())?;

    let shadow_pixels = if cpu_only {
        info!("using host reference kernels");
        detect_file(&HostBackend::new(), &input, &output, &config)?
    } else {
        let context = GpuContext::from_options(&config.accelerator)?;
        detect_file(&context, &input, &output, &config)?
    };

    info!(
        output = %output.display(),
        shadow_pixels,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "wrote mask"
    );
    println!("{}", output.display());
    Ok(())
}
