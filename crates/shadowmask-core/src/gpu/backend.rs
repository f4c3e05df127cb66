//! The seam between the kernel pipeline and whatever executes the kernels.
//!
//! [`GpuContext`](super::GpuContext) drives a wgpu device through this trait;
//! [`HostBackend`](super::HostBackend) runs the same kernels in host memory.
//! The pipeline only ever talks to `ComputeBackend`, so buffer lifetimes and
//! stage ordering are identical on both.

use std::fmt;

use super::error::GpuError;
use crate::models::ImageDims;

/// Name of the kernel set compiled into every device context.
pub const KERNEL_SET: &str = "shadow_ratio";

/// Number of kernel entry points in [`KERNEL_SET`].
pub const KERNEL_COUNT: usize = 3;

/// Kernel entry points of the shadow-ratio program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Pixels to packed hue/saturation/intensity words.
    Convert1,
    /// Pixels to packed hue/saturation/value words.
    Convert2,
    /// Packed words to one ratio byte per pixel.
    Ratio,
}

impl Kernel {
    pub const ALL: [Kernel; KERNEL_COUNT] = [Kernel::Convert1, Kernel::Convert2, Kernel::Ratio];

    /// WGSL entry point name.
    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::Convert1 => "hsi_convert1",
            Kernel::Convert2 => "hsi_convert2",
            Kernel::Ratio => "tsai_ratio",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Kernel::Convert1 => 0,
            Kernel::Convert2 => 1,
            Kernel::Ratio => 2,
        }
    }

    /// Number of invocations needed to cover an image.
    ///
    /// Conversions run once per pixel; the ratio kernel writes four packed
    /// bytes per invocation.
    pub fn work_items(self, dims: &ImageDims) -> u32 {
        let pixels = dims.pixel_count() as u32;
        match self {
            Kernel::Convert1 | Kernel::Convert2 => pixels,
            Kernel::Ratio => pixels.div_ceil(4),
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

/// Accelerator class, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Discrete,
    Integrated,
    Cpu,
    Other,
}

impl DeviceKind {
    pub fn is_gpu(self) -> bool {
        matches!(self, DeviceKind::Discrete | DeviceKind::Integrated)
    }

    /// Buffer allocation strategy for this device class.
    pub fn residency(self) -> Result<Residency, GpuError> {
        match self {
            DeviceKind::Discrete => Ok(Residency::Copied),
            DeviceKind::Integrated | DeviceKind::Cpu => Ok(Residency::Mapped),
            DeviceKind::Other => Err(GpuError::UnsupportedDeviceType { kind: self }),
        }
    }
}

impl From<wgpu::DeviceType> for DeviceKind {
    fn from(ty: wgpu::DeviceType) -> Self {
        match ty {
            wgpu::DeviceType::DiscreteGpu => DeviceKind::Discrete,
            wgpu::DeviceType::IntegratedGpu => DeviceKind::Integrated,
            wgpu::DeviceType::Cpu => DeviceKind::Cpu,
            wgpu::DeviceType::VirtualGpu | wgpu::DeviceType::Other => DeviceKind::Other,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Discrete => "discrete GPU",
            DeviceKind::Integrated => "integrated GPU",
            DeviceKind::Cpu => "CPU",
            DeviceKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// How a run buffer's memory relates to host memory.
///
/// Only throughput differs between the two; results are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Device-resident memory, host data copied in at allocation.
    Copied,
    /// Host-visible memory written in place at allocation.
    Mapped,
}

/// Device access a kernel needs on an output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    WriteOnly,
}

/// Operations the kernel pipeline needs from an accelerator.
///
/// Implementations are used from a single controlling thread per run; a
/// backend value may be moved to another thread between runs.
pub trait ComputeBackend {
    /// Device allocation handle. Dropping it without [`release`](Self::release)
    /// must still free it.
    type Buffer;
    /// Kernel arguments bound to concrete buffers.
    type Binding;

    fn device_kind(&self) -> DeviceKind;

    /// Allocate the read-only input buffer, filled from `pixels`.
    fn create_input(
        &self,
        label: &'static str,
        pixels: &[u8],
        residency: Residency,
    ) -> Result<Self::Buffer, GpuError>;

    /// Allocate an uninitialised output buffer of `len` bytes.
    fn create_output(
        &self,
        label: &'static str,
        len: u64,
        access: Access,
        residency: Residency,
    ) -> Result<Self::Buffer, GpuError>;

    /// Logical byte length the buffer was created with.
    fn buffer_len(&self, buffer: &Self::Buffer) -> u64;

    /// Bind `(src, dst, width, height, channels)` for `kernel`.
    fn bind(
        &self,
        kernel: Kernel,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        dims: &ImageDims,
    ) -> Result<Self::Binding, GpuError>;

    /// Submit one execution of `kernel` over `work_items` invocations.
    fn enqueue(
        &self,
        kernel: Kernel,
        binding: &Self::Binding,
        work_items: u32,
    ) -> Result<(), GpuError>;

    /// Flush submitted work and block until the device is idle.
    fn finish(&self) -> Result<(), GpuError>;

    /// Blocking read of the first `len` bytes of `buffer`.
    fn read_back(&self, buffer: &Self::Buffer, len: usize) -> Result<Vec<u8>, GpuError>;

    /// Free a buffer's device memory.
    fn release(&self, buffer: Self::Buffer);
}
