use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use shadowmask_cli::Overrides;
use shadowmask_core::{DeviceClass, Threshold};

mod commands;

use commands::{cmd_batch, cmd_detect, cmd_devices};

#[derive(Parser)]
#[command(name = "shadowmask")]
#[command(version, about = "Shadow mask detection on compute accelerators", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List compute platforms and their devices
    Devices {
        /// Device types to list: gpu, cpu or auto
        #[arg(long, value_name = "CLASS", value_parser = parse_device_class, default_value = "auto")]
        class: DeviceClass,
    },

    /// Detect shadows in one image and write a PNG mask
    Detect {
        /// Input image
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output file or directory
        #[arg(short, long, value_name = "OUT")]
        out: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Detect shadows in many images in parallel
    Batch {
        /// Input files or directories
        #[arg(value_name = "INPUTS", required = true)]
        inputs: Vec<PathBuf>,

        /// Output directory
        #[arg(short, long, value_name = "DIR")]
        out: Option<PathBuf>,

        /// Number of worker threads (default: all cores)
        #[arg(short = 'j', long, value_name = "N")]
        threads: Option<usize>,

        #[command(flatten)]
        run: RunArgs,
    },
}

/// Settings shared by the commands that run the pipeline.
#[derive(Args)]
struct RunArgs {
    /// Platform index (overrides config)
    #[arg(long, value_name = "N")]
    platform: Option<usize>,

    /// Device index within the platform (overrides config)
    #[arg(long, value_name = "N")]
    device: Option<usize>,

    /// Device types counted during enumeration: gpu, cpu or auto
    #[arg(long, value_name = "CLASS", value_parser = parse_device_class)]
    class: Option<DeviceClass>,

    /// Run the host reference kernels instead of an accelerator
    #[arg(long)]
    cpu: bool,

    /// Always compile kernels from source
    #[arg(long)]
    no_precompiled: bool,

    /// Threshold for both ratio images: otsu or 0-255
    #[arg(long, value_name = "otsu|N", value_parser = parse_threshold)]
    threshold: Option<Threshold>,

    /// Config file path
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl RunArgs {
    fn into_overrides(self) -> (Overrides, bool) {
        let overrides = Overrides {
            config: self.config,
            platform: self.platform,
            device: self.device,
            class: self.class,
            no_precompiled: self.no_precompiled,
            threshold: self.threshold,
        };
        (overrides, self.cpu)
    }
}

fn parse_device_class(s: &str) -> Result<DeviceClass, String> {
    match s.to_ascii_lowercase().as_str() {
        "gpu" => Ok(DeviceClass::Gpu),
        "cpu" => Ok(DeviceClass::Cpu),
        "auto" => Ok(DeviceClass::Auto),
        other => Err(format!("unknown device class '{}': expected gpu, cpu or auto", other)),
    }
}

fn parse_threshold(s: &str) -> Result<Threshold, String> {
    s.parse()
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Devices { class } => cmd_devices(class),

        Commands::Detect { input, out, run } => {
            let (overrides, cpu_only) = run.into_overrides();
            cmd_detect(input, out, overrides, cpu_only)
        }

        Commands::Batch {
            inputs,
            out,
            threads,
            run,
        } => {
            let (overrides, cpu_only) = run.into_overrides();
            cmd_batch(inputs, out, threads, overrides, cpu_only)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
