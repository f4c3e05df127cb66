//! Host-memory execution of the shadow-ratio kernels.
//!
//! The reference kernels here are the authoritative definition of the numeric
//! transform; `shaders/shadow_ratio.wgsl` mirrors them with the same integer
//! arithmetic so GPU output is bit-identical.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use rayon::prelude::*;

use super::backend::{Access, ComputeBackend, DeviceKind, Kernel, Residency};
use super::error::{GpuError, CODE_VALIDATION};
use crate::models::ImageDims;

/// Pixels to one packed word per pixel.
pub type ConvertFn = fn(&[u8], &ImageDims) -> Vec<u32>;
/// Packed words to one byte per pixel.
pub type RatioFn = fn(&[u32]) -> Vec<u8>;

/// Kernel implementations used by [`HostBackend`].
#[derive(Clone, Copy)]
pub struct HostKernels {
    pub convert1: ConvertFn,
    pub convert2: ConvertFn,
    pub ratio: RatioFn,
}

impl HostKernels {
    /// The shadow-ratio transform, matching the WGSL program.
    pub fn reference() -> Self {
        Self {
            convert1: convert_intensity,
            convert2: convert_value,
            ratio: ratio_bytes,
        }
    }

    /// Pass-through kernels: channel 0 flows unchanged into the ratio image.
    pub fn identity() -> Self {
        Self {
            convert1: identity_convert,
            convert2: identity_convert,
            ratio: identity_ratio,
        }
    }
}

impl Default for HostKernels {
    fn default() -> Self {
        Self::reference()
    }
}

// ============================================================================
// Reference kernels
// ============================================================================

/// RGB of pixel `p`. One- and two-channel images replicate channel 0.
#[inline]
fn rgb_at(pixels: &[u8], p: usize, channels: usize) -> (i32, i32, i32) {
    let base = p * channels;
    if channels >= 3 {
        (
            pixels[base] as i32,
            pixels[base + 1] as i32,
            pixels[base + 2] as i32,
        )
    } else {
        let v = pixels[base] as i32;
        (v, v, v)
    }
}

/// Integer hue (0..=251, six sectors of 42) and saturation (0..=255).
#[inline]
pub fn hue_saturation(r: i32, g: i32, b: i32) -> (u32, u32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let chroma = max - min;

    let hue = if chroma == 0 {
        0
    } else if max == r {
        let h = 42 * (g - b) / chroma;
        if h < 0 {
            h + 252
        } else {
            h
        }
    } else if max == g {
        84 + 42 * (b - r) / chroma
    } else {
        168 + 42 * (r - g) / chroma
    };

    let saturation = if max == 0 { 0 } else { 255 * chroma / max };
    (hue as u32, saturation as u32)
}

#[inline]
fn pack(hue: u32, saturation: u32, level: u32) -> u32 {
    (hue << 16) | (saturation << 8) | level
}

pub fn convert_intensity(pixels: &[u8], dims: &ImageDims) -> Vec<u32> {
    let channels = dims.channels as usize;
    (0..dims.pixel_count())
        .into_par_iter()
        .map(|p| {
            let (r, g, b) = rgb_at(pixels, p, channels);
            let (h, s) = hue_saturation(r, g, b);
            pack(h, s, ((r + g + b) / 3) as u32)
        })
        .collect()
}

pub fn convert_value(pixels: &[u8], dims: &ImageDims) -> Vec<u32> {
    let channels = dims.channels as usize;
    (0..dims.pixel_count())
        .into_par_iter()
        .map(|p| {
            let (r, g, b) = rgb_at(pixels, p, channels);
            let (h, s) = hue_saturation(r, g, b);
            pack(h, s, r.max(g).max(b) as u32)
        })
        .collect()
}

/// Tsai hue/level ratio of one packed word, scaled to a byte.
#[inline]
pub fn ratio_of(word: u32) -> u8 {
    let hue = (word >> 16) & 0xff;
    let level = word & 0xff;
    (255 * (hue + 1) / (hue + level + 2)) as u8
}

pub fn ratio_bytes(words: &[u32]) -> Vec<u8> {
    words.par_iter().map(|&w| ratio_of(w)).collect()
}

fn identity_convert(pixels: &[u8], dims: &ImageDims) -> Vec<u32> {
    let channels = dims.channels as usize;
    (0..dims.pixel_count())
        .map(|p| pixels[p * channels] as u32)
        .collect()
}

fn identity_ratio(words: &[u32]) -> Vec<u8> {
    words.iter().map(|&w| (w & 0xff) as u8).collect()
}

// ============================================================================
// Backend
// ============================================================================

/// Handle to a host-side buffer. Dropping the handle frees its memory.
pub struct HostBuffer {
    id: u64,
    len: u64,
    memory: Arc<Mutex<HostMemory>>,
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        lock(&self.memory).buffers.remove(&self.id);
    }
}

/// Bound kernel arguments.
#[derive(Debug, Clone)]
pub struct HostBinding {
    kernel: Kernel,
    src: u64,
    dst: u64,
    dims: ImageDims,
}

#[derive(Default)]
struct HostMemory {
    next_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
}

fn lock(memory: &Mutex<HostMemory>) -> MutexGuard<'_, HostMemory> {
    memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// [`ComputeBackend`] that executes kernels synchronously in host memory.
///
/// One backend may serve many runs from different threads at once. The memory
/// lock is never held while a kernel runs, since the kernels themselves fan
/// out onto the rayon pool.
pub struct HostBackend {
    kind: DeviceKind,
    kernels: HostKernels,
    memory: Arc<Mutex<HostMemory>>,
}

impl HostBackend {
    /// Reference kernels, reporting itself as a CPU device.
    pub fn new() -> Self {
        Self::with_kernels(HostKernels::reference())
    }

    pub fn with_kernels(kernels: HostKernels) -> Self {
        Self {
            kind: DeviceKind::Cpu,
            kernels,
            memory: Arc::new(Mutex::new(HostMemory::default())),
        }
    }

    /// Report a different device class; only the allocation strategy changes.
    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Number of buffers allocated and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.memory().buffers.len()
    }

    fn memory(&self) -> MutexGuard<'_, HostMemory> {
        lock(&self.memory)
    }

    fn insert(&self, data: Vec<u8>) -> HostBuffer {
        let mut memory = self.memory();
        let id = memory.next_id;
        memory.next_id += 1;
        let len = data.len() as u64;
        memory.buffers.insert(id, data);
        HostBuffer {
            id,
            len,
            memory: Arc::clone(&self.memory),
        }
    }

    fn execute(&self, binding: &HostBinding) -> Result<(), GpuError> {
        let operation = format!("enqueue {}", binding.kernel);
        let src = self
            .memory()
            .buffers
            .get(&binding.src)
            .cloned()
            .ok_or_else(|| GpuError::native(CODE_VALIDATION, &operation, "source released"))?;

        let output = match binding.kernel {
            Kernel::Convert1 | Kernel::Convert2 => {
                let convert = if binding.kernel == Kernel::Convert1 {
                    self.kernels.convert1
                } else {
                    self.kernels.convert2
                };
                let words = convert(&src, &binding.dims);
                bytemuck::cast_slice::<u32, u8>(&words).to_vec()
            }
            Kernel::Ratio => {
                let word_count = binding.dims.pixel_count();
                let words: Vec<u32> = src[..word_count * 4]
                    .chunks_exact(4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                (self.kernels.ratio)(&words)
            }
        };

        let mut memory = self.memory();
        let dst = memory
            .buffers
            .get_mut(&binding.dst)
            .ok_or_else(|| GpuError::native(CODE_VALIDATION, &operation, "destination released"))?;
        let n = output.len().min(dst.len());
        dst[..n].copy_from_slice(&output[..n]);
        Ok(())
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes a kernel reads from `src` and writes to `dst`.
pub(crate) fn binding_extent(kernel: Kernel, dims: &ImageDims) -> (u64, u64) {
    let pixels = dims.pixel_count() as u64;
    match kernel {
        Kernel::Convert1 | Kernel::Convert2 => (dims.byte_len() as u64, pixels * 4),
        Kernel::Ratio => (pixels * 4, pixels),
    }
}

impl ComputeBackend for HostBackend {
    type Buffer = HostBuffer;
    type Binding = HostBinding;

    fn device_kind(&self) -> DeviceKind {
        self.kind
    }

    fn create_input(
        &self,
        _label: &'static str,
        pixels: &[u8],
        _residency: Residency,
    ) -> Result<HostBuffer, GpuError> {
        Ok(self.insert(pixels.to_vec()))
    }

    fn create_output(
        &self,
        _label: &'static str,
        len: u64,
        _access: Access,
        _residency: Residency,
    ) -> Result<HostBuffer, GpuError> {
        Ok(self.insert(vec![0u8; len as usize]))
    }

    fn buffer_len(&self, buffer: &HostBuffer) -> u64 {
        buffer.len
    }

    fn bind(
        &self,
        kernel: Kernel,
        src: &HostBuffer,
        dst: &HostBuffer,
        dims: &ImageDims,
    ) -> Result<HostBinding, GpuError> {
        let (needs_src, needs_dst) = binding_extent(kernel, dims);
        if src.len < needs_src || dst.len < needs_dst {
            return Err(GpuError::native(
                CODE_VALIDATION,
                format!("bind {}", kernel),
                format!(
                    "buffers too small: src {} < {} or dst {} < {}",
                    src.len, needs_src, dst.len, needs_dst
                ),
            ));
        }
        Ok(HostBinding {
            kernel,
            src: src.id,
            dst: dst.id,
            dims: *dims,
        })
    }

    fn enqueue(
        &self,
        kernel: Kernel,
        binding: &HostBinding,
        _work_items: u32,
    ) -> Result<(), GpuError> {
        if kernel != binding.kernel {
            return Err(GpuError::native(
                CODE_VALIDATION,
                format!("enqueue {}", kernel),
                format!("binding was created for {}", binding.kernel),
            ));
        }
        self.execute(binding)
    }

    fn finish(&self) -> Result<(), GpuError> {
        Ok(())
    }

    fn read_back(&self, buffer: &HostBuffer, len: usize) -> Result<Vec<u8>, GpuError> {
        let memory = self.memory();
        let data = memory
            .buffers
            .get(&buffer.id)
            .ok_or_else(|| GpuError::native(CODE_VALIDATION, "read back", "buffer released"))?;
        if len > data.len() {
            return Err(GpuError::native(
                CODE_VALIDATION,
                "read back",
                format!("requested {} bytes from a {} byte buffer", len, data.len()),
            ));
        }
        Ok(data[..len].to_vec())
    }

    fn release(&self, buffer: HostBuffer) {
        drop(buffer);
    }
}
