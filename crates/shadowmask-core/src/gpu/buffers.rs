//! Per-run device buffers for the shadow-ratio pipeline.

use std::fmt;

use tracing::debug;

use super::backend::{Access, ComputeBackend, Residency};
use super::error::GpuError;
use crate::models::{ImageDims, PixelImage};

/// The four buffers a run allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Interleaved input pixels, read-only on the device.
    Input,
    /// Convert1 output, one packed word per pixel.
    Numeric1,
    /// Convert2 output, one packed word per pixel.
    Numeric2,
    /// Ratio output, one byte per pixel. Reused by both ratio passes.
    Scalar,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Input, Slot::Numeric1, Slot::Numeric2, Slot::Scalar];

    pub fn name(self) -> &'static str {
        match self {
            Slot::Input => "input",
            Slot::Numeric1 => "numeric1",
            Slot::Numeric2 => "numeric2",
            Slot::Scalar => "scalar",
        }
    }

    fn index(self) -> usize {
        match self {
            Slot::Input => 0,
            Slot::Numeric1 => 1,
            Slot::Numeric2 => 2,
            Slot::Scalar => 3,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte lengths of every slot for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub input: u64,
    pub numeric: u64,
    pub scalar: u64,
}

impl BufferLayout {
    pub fn for_image(dims: &ImageDims) -> Result<Self, GpuError> {
        let pixels = (dims.width as u64)
            .checked_mul(dims.height as u64)
            .ok_or_else(|| overflow("pixel count", dims))?;
        let input = pixels
            .checked_mul(dims.channels as u64)
            .ok_or_else(|| overflow("input buffer", dims))?;
        let numeric = pixels
            .checked_mul(4)
            .ok_or_else(|| overflow("numeric buffer", dims))?;

        Ok(Self {
            input,
            numeric,
            scalar: pixels,
        })
    }

    pub fn len(&self, slot: Slot) -> u64 {
        match slot {
            Slot::Input => self.input,
            Slot::Numeric1 | Slot::Numeric2 => self.numeric,
            Slot::Scalar => self.scalar,
        }
    }
}

fn overflow(what: &str, dims: &ImageDims) -> GpuError {
    GpuError::AllocationFailed {
        what: what.to_string(),
        reason: format!(
            "size of {}x{}x{} image overflows",
            dims.width, dims.height, dims.channels
        ),
    }
}

/// Buffers owned by one pipeline run.
///
/// Each slot is released at most once, either explicitly through
/// [`release_slot`](Self::release_slot) / [`release`](Self::release) or when
/// the value is dropped.
pub struct RunBuffers<'b, B: ComputeBackend> {
    backend: &'b B,
    layout: BufferLayout,
    residency: Residency,
    slots: [Option<B::Buffer>; 4],
}

impl<'b, B: ComputeBackend> RunBuffers<'b, B> {
    /// Allocate and fill every slot for `image`.
    ///
    /// A failure part-way releases whatever was already allocated.
    pub fn allocate(backend: &'b B, image: &PixelImage<'_>) -> Result<Self, GpuError> {
        let residency = backend.device_kind().residency()?;
        let layout = BufferLayout::for_image(&image.dims)?;

        let mut buffers = Self {
            backend,
            layout,
            residency,
            slots: [None, None, None, None],
        };

        buffers.slots[Slot::Input.index()] =
            Some(backend.create_input(Slot::Input.name(), image.data, residency)?);
        for (slot, access) in [
            (Slot::Numeric1, Access::ReadWrite),
            (Slot::Numeric2, Access::ReadWrite),
            (Slot::Scalar, Access::WriteOnly),
        ] {
            let buffer = backend.create_output(slot.name(), layout.len(slot), access, residency)?;
            buffers.slots[slot.index()] = Some(buffer);
        }

        buffers.verify()?;

        debug!(
            residency = ?residency,
            input = layout.input,
            numeric = layout.numeric,
            scalar = layout.scalar,
            "allocated run buffers"
        );
        Ok(buffers)
    }

    fn verify(&self) -> Result<(), GpuError> {
        for slot in Slot::ALL {
            let buffer = self.get(slot)?;
            let actual = self.backend.buffer_len(buffer);
            let expected = self.layout.len(slot);
            if actual != expected {
                return Err(GpuError::BufferSizeMismatch {
                    slot: slot.name(),
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Borrow a live slot.
    pub fn get(&self, slot: Slot) -> Result<&B::Buffer, GpuError> {
        self.slots[slot.index()]
            .as_ref()
            .ok_or(GpuError::BufferReleased(slot.name()))
    }

    pub fn is_live(&self, slot: Slot) -> bool {
        self.slots[slot.index()].is_some()
    }

    /// Free one slot. Releasing an already released slot does nothing.
    pub fn release_slot(&mut self, slot: Slot) {
        if let Some(buffer) = self.slots[slot.index()].take() {
            self.backend.release(buffer);
        }
    }

    /// Free every remaining slot.
    pub fn release(&mut self) {
        for slot in Slot::ALL {
            self.release_slot(slot);
        }
    }
}

impl<B: ComputeBackend> Drop for RunBuffers<'_, B> {
    fn drop(&mut self) {
        self.release();
    }
}
