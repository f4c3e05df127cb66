//! Accelerator pipeline for the shadow-ratio kernels.
//!
//! [`DeviceRegistry`] discovers devices, [`GpuContext`] opens one and loads the
//! kernel program through [`ProgramCache`], and [`KernelPipeline`] runs the
//! kernels over [`RunBuffers`] on any [`ComputeBackend`]. [`HostBackend`] runs
//! the same pipeline in host memory.

mod backend;
mod buffers;
mod context;
mod error;
mod host;
mod pipeline;
mod program_cache;
mod registry;
mod shaders;

pub use backend::{Access, ComputeBackend, DeviceKind, Kernel, Residency, KERNEL_COUNT, KERNEL_SET};
pub use buffers::{BufferLayout, RunBuffers, Slot};
pub use context::{CompiledKernels, DeviceBuffer, GpuContext, WgpuBinding, WgpuDevice, WgpuPlatforms, WgpuProgramBuilder};
pub use error::{
    GpuError, CODE_DEVICE_LOST, CODE_INTERNAL, CODE_MAP_FAILED, CODE_OUT_OF_MEMORY,
    CODE_VALIDATION,
};
pub use host::{
    convert_intensity, convert_value, hue_saturation, ratio_bytes, ratio_of, HostBackend,
    HostBinding, HostBuffer, HostKernels,
};
pub use pipeline::{
    dispatch_dims, process_image, round_up, KernelPipeline, PipelineRun, PipelineState,
    RatioImages,
};
pub use program_cache::{
    sanitize_device_name, KernelSource, ProgramBuilder, ProgramCache, ProgramOrigin,
};
pub use registry::{
    DeviceClass, DeviceHandle, DeviceRegistry, DeviceReport, PlatformReport, PlatformSource,
};
pub use shaders::Shaders;

/// Check if GPU acceleration is available on this system.
pub fn is_gpu_available() -> bool {
    GpuContext::is_available()
}

/// Get information about the available GPU device.
pub fn gpu_info() -> Option<String> {
    GpuContext::device_info()
}

#[cfg(test)]
mod tests;
