//! Shared utilities for shadowmask-cli

pub mod batch;
pub mod processing;

pub use batch::{run_batch, worker_backends, BatchReport};
pub use processing::{
    detect_file, determine_output_path, expand_inputs, load_rgb, resolve_config, Overrides,
    SUPPORTED_EXTENSIONS,
};
