//! Shadowmask Core Library
//!
//! Runs the shadow-ratio kernel pipeline on a compute accelerator and reduces
//! the two intermediate ratio images to a single binary mask.

pub mod config;
pub mod gpu;
pub mod mask;
pub mod models;

// Re-export commonly used types
pub use config::{load_config, ConfigHandle, ShadowmaskConfig};
pub use gpu::{
    process_image, ComputeBackend, DeviceClass, DeviceKind, DeviceRegistry, GpuContext, GpuError,
    HostBackend, HostKernels, Kernel, KernelPipeline, PipelineState, ProgramCache, RunBuffers,
    WgpuPlatforms,
};
pub use mask::{BinaryMask, Threshold};
pub use models::{AcceleratorOptions, ImageDims, MaskOptions, PixelImage, ShadowMask};
