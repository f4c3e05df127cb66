//! Plain data types shared by the accelerator pipeline and its callers.

use std::path::PathBuf;

use serde::Deserialize;

use crate::gpu::{DeviceClass, GpuError};
use crate::mask::{BinaryMask, Threshold};

/// Largest channel count the conversion kernels understand.
pub const MAX_CHANNELS: u8 = 4;

/// The final mask handed to downstream classifiers.
pub type ShadowMask = BinaryMask;

/// Validated image geometry.
///
/// Every byte index of the interleaved pixel buffer must fit in a `u32`,
/// which is what the WGSL kernels address with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDims {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl ImageDims {
    pub fn new(width: u32, height: u32, channels: u8) -> Result<Self, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::InvalidImage(format!(
                "image must be at least 1x1, got {}x{}",
                width, height
            )));
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(GpuError::InvalidImage(format!(
                "unsupported channel count {} (expected 1..={})",
                channels, MAX_CHANNELS
            )));
        }

        // Numeric buffers hold one u32 per pixel, so 4 bytes per pixel is the
        // widest per-pixel footprint the pipeline allocates.
        let widest = width as u64 * height as u64 * u64::from(channels.max(4));
        if widest > u32::MAX as u64 {
            return Err(GpuError::InvalidImage(format!(
                "image {}x{}x{} exceeds the addressable buffer size",
                width, height, channels
            )));
        }

        Ok(Self {
            width,
            height,
            channels,
        })
    }

    /// Number of pixels (width * height).
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of bytes in the interleaved input buffer.
    pub fn byte_len(&self) -> usize {
        self.pixel_count() * self.channels as usize
    }
}

/// Borrowed view of a decoded image: row-major, interleaved channels.
#[derive(Debug, Clone, Copy)]
pub struct PixelImage<'a> {
    pub data: &'a [u8],
    pub dims: ImageDims,
}

impl<'a> PixelImage<'a> {
    pub fn new(data: &'a [u8], width: u32, height: u32, channels: u8) -> Result<Self, GpuError> {
        let dims = ImageDims::new(width, height, channels)?;
        if data.len() != dims.byte_len() {
            return Err(GpuError::InvalidImage(format!(
                "pixel buffer holds {} bytes, expected {} for {}x{}x{}",
                data.len(),
                dims.byte_len(),
                width,
                height,
                channels
            )));
        }
        Ok(Self { data, dims })
    }
}

/// Resolved accelerator settings consumed by [`crate::gpu::GpuContext::open`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AcceleratorOptions {
    /// Try the persisted program binary before compiling from source.
    pub use_precompiled_kernels: bool,
    /// Which adapter types count as devices during enumeration.
    pub device_class: DeviceClass,
    pub platform_index: usize,
    pub device_index: usize,
    /// Directory holding `{kernel_set}.wgsl`; the embedded source is used when unset.
    pub kernel_dir: Option<PathBuf>,
    /// Where program binaries are persisted.
    pub cache_dir: PathBuf,
}

impl Default for AcceleratorOptions {
    fn default() -> Self {
        Self {
            use_precompiled_kernels: true,
            device_class: DeviceClass::Auto,
            platform_index: 0,
            device_index: 0,
            kernel_dir: None,
            cache_dir: default_cache_dir(),
        }
    }
}

/// Default program-binary directory: `<user cache>/shadowmask/kernels`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("shadowmask")
        .join("kernels")
}

/// Resolved settings for turning ratio images into the final mask.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct MaskOptions {
    pub threshold: Threshold,
}
