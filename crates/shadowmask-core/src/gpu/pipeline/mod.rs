//! Kernel pipeline orchestration.
//!
//! A run walks a fixed sequence of states. Every dispatching transition ends
//! with the backend's flush-and-finish barrier, so each state boundary is a
//! point where all earlier device work has completed.

mod dispatch;

pub use dispatch::{dispatch_dims, round_up};

use std::fmt;

use tracing::{debug, info_span};

use super::backend::{ComputeBackend, Kernel};
use super::buffers::{RunBuffers, Slot};
use super::error::GpuError;
use crate::mask::{binarize, join, to_gray_image};
use crate::models::{ImageDims, MaskOptions, PixelImage, ShadowMask};

/// Position of a run in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    BuffersReady,
    Stage1Dispatched,
    Stage1Reduced,
    Stage2ADispatched,
    Stage2AReduced,
    Stage2BDispatched,
    Done,
}

impl PipelineState {
    pub const ALL: [PipelineState; 8] = [
        PipelineState::Idle,
        PipelineState::BuffersReady,
        PipelineState::Stage1Dispatched,
        PipelineState::Stage1Reduced,
        PipelineState::Stage2ADispatched,
        PipelineState::Stage2AReduced,
        PipelineState::Stage2BDispatched,
        PipelineState::Done,
    ];

    /// The state that follows this one, or `None` once done.
    pub fn next(self) -> Option<PipelineState> {
        match self {
            PipelineState::Idle => Some(PipelineState::BuffersReady),
            PipelineState::BuffersReady => Some(PipelineState::Stage1Dispatched),
            PipelineState::Stage1Dispatched => Some(PipelineState::Stage1Reduced),
            PipelineState::Stage1Reduced => Some(PipelineState::Stage2ADispatched),
            PipelineState::Stage2ADispatched => Some(PipelineState::Stage2AReduced),
            PipelineState::Stage2AReduced => Some(PipelineState::Stage2BDispatched),
            PipelineState::Stage2BDispatched => Some(PipelineState::Done),
            PipelineState::Done => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::BuffersReady => "buffers-ready",
            PipelineState::Stage1Dispatched => "stage1-dispatched",
            PipelineState::Stage1Reduced => "stage1-reduced",
            PipelineState::Stage2ADispatched => "stage2a-dispatched",
            PipelineState::Stage2AReduced => "stage2a-reduced",
            PipelineState::Stage2BDispatched => "stage2b-dispatched",
            PipelineState::Done => "done",
        };
        f.write_str(name)
    }
}

/// The two single-channel ratio images a run produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatioImages {
    pub dims: ImageDims,
    /// Ratio of the hue/saturation/intensity conversion.
    pub first: Vec<u8>,
    /// Ratio of the hue/saturation/value conversion.
    pub second: Vec<u8>,
}

/// Runs the shadow-ratio kernels on one backend.
pub struct KernelPipeline<'b, B: ComputeBackend> {
    backend: &'b B,
}

impl<'b, B: ComputeBackend> KernelPipeline<'b, B> {
    pub fn new(backend: &'b B) -> Self {
        Self { backend }
    }

    /// Begin a run without executing any transition.
    pub fn start<'i>(&self, image: PixelImage<'i>) -> PipelineRun<'b, 'i, B> {
        PipelineRun {
            backend: self.backend,
            image,
            state: PipelineState::Idle,
            convert1: None,
            convert2: None,
            ratio: None,
            buffers: None,
            first: None,
            second: None,
        }
    }

    /// Execute a full run and return both ratio images.
    pub fn run(&self, image: PixelImage<'_>) -> Result<RatioImages, GpuError> {
        let span = info_span!(
            "pipeline",
            width = image.dims.width,
            height = image.dims.height,
            channels = image.dims.channels
        );
        let _guard = span.enter();

        let mut run = self.start(image);
        while run.state() != PipelineState::Done {
            run.advance()?;
        }
        run.into_ratio_images()
    }
}

/// One in-flight run. Buffers are released on every exit path.
pub struct PipelineRun<'b, 'i, B: ComputeBackend> {
    backend: &'b B,
    image: PixelImage<'i>,
    state: PipelineState,
    // Bindings drop before the buffers they reference.
    convert1: Option<B::Binding>,
    convert2: Option<B::Binding>,
    ratio: Option<B::Binding>,
    buffers: Option<RunBuffers<'b, B>>,
    first: Option<Vec<u8>>,
    second: Option<Vec<u8>>,
}

impl<'b, 'i, B: ComputeBackend> PipelineRun<'b, 'i, B> {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Buffers of the run, once allocated and until released at the end.
    pub fn buffers(&self) -> Option<&RunBuffers<'b, B>> {
        self.buffers.as_ref()
    }

    /// Execute the next transition.
    ///
    /// On failure every run buffer is released and the error names the state
    /// that was being entered. Advancing a finished run is a no-op.
    pub fn advance(&mut self) -> Result<PipelineState, GpuError> {
        let Some(next) = self.state.next() else {
            return Ok(self.state);
        };

        match self.enter(next) {
            Ok(()) => {
                debug!(from = %self.state, to = %next, "pipeline transition");
                self.state = next;
                Ok(next)
            }
            Err(err) => {
                self.release_all();
                Err(err.at_stage(next))
            }
        }
    }

    fn enter(&mut self, next: PipelineState) -> Result<(), GpuError> {
        let dims = self.image.dims;
        match next {
            PipelineState::Idle => Ok(()),
            PipelineState::BuffersReady => {
                let buffers = RunBuffers::allocate(self.backend, &self.image)?;
                let input = buffers.get(Slot::Input)?;
                self.convert1 = Some(self.backend.bind(
                    Kernel::Convert1,
                    input,
                    buffers.get(Slot::Numeric1)?,
                    &dims,
                )?);
                self.convert2 = Some(self.backend.bind(
                    Kernel::Convert2,
                    input,
                    buffers.get(Slot::Numeric2)?,
                    &dims,
                )?);
                self.buffers = Some(buffers);
                Ok(())
            }
            PipelineState::Stage1Dispatched => {
                let binding = bound(&self.convert1, Kernel::Convert1)?;
                self.backend
                    .enqueue(Kernel::Convert1, binding, Kernel::Convert1.work_items(&dims))?;
                self.backend.finish()
            }
            PipelineState::Stage1Reduced => {
                let ratio = self.reduce(Slot::Numeric1)?;
                self.first = Some(ratio);
                self.convert1 = None;
                self.buffers_mut()?.release_slot(Slot::Numeric1);
                Ok(())
            }
            PipelineState::Stage2ADispatched => {
                let binding = bound(&self.convert2, Kernel::Convert2)?;
                self.backend
                    .enqueue(Kernel::Convert2, binding, Kernel::Convert2.work_items(&dims))?;
                self.convert2 = None;
                self.buffers_mut()?.release_slot(Slot::Input);
                self.backend.finish()
            }
            PipelineState::Stage2AReduced => {
                let buffers = self.buffers_ref()?;
                let binding = self.backend.bind(
                    Kernel::Ratio,
                    buffers.get(Slot::Numeric2)?,
                    buffers.get(Slot::Scalar)?,
                    &dims,
                )?;
                self.backend
                    .enqueue(Kernel::Ratio, &binding, Kernel::Ratio.work_items(&dims))?;
                self.ratio = Some(binding);
                self.backend.finish()
            }
            PipelineState::Stage2BDispatched => {
                let scalar = self.buffers_ref()?.get(Slot::Scalar)?;
                let ratio = self.backend.read_back(scalar, dims.pixel_count())?;
                self.second = Some(ratio);
                self.ratio = None;
                let buffers = self.buffers_mut()?;
                buffers.release_slot(Slot::Numeric2);
                buffers.release_slot(Slot::Scalar);
                Ok(())
            }
            PipelineState::Done => {
                self.release_all();
                Ok(())
            }
        }
    }

    /// Ratio kernel from `numeric` into the scalar slot, then read it back.
    fn reduce(&self, numeric: Slot) -> Result<Vec<u8>, GpuError> {
        let dims = self.image.dims;
        let buffers = self.buffers_ref()?;
        let scalar = buffers.get(Slot::Scalar)?;
        let binding = self
            .backend
            .bind(Kernel::Ratio, buffers.get(numeric)?, scalar, &dims)?;
        self.backend
            .enqueue(Kernel::Ratio, &binding, Kernel::Ratio.work_items(&dims))?;
        self.backend.finish()?;
        self.backend.read_back(scalar, dims.pixel_count())
    }

    fn buffers_ref(&self) -> Result<&RunBuffers<'b, B>, GpuError> {
        self.buffers
            .as_ref()
            .ok_or(GpuError::BufferReleased(Slot::Input.name()))
    }

    fn buffers_mut(&mut self) -> Result<&mut RunBuffers<'b, B>, GpuError> {
        self.buffers
            .as_mut()
            .ok_or(GpuError::BufferReleased(Slot::Input.name()))
    }

    fn release_all(&mut self) {
        self.convert1 = None;
        self.convert2 = None;
        self.ratio = None;
        if let Some(mut buffers) = self.buffers.take() {
            buffers.release();
        }
    }

    /// Ratio images of a finished run.
    pub fn into_ratio_images(mut self) -> Result<RatioImages, GpuError> {
        if self.state != PipelineState::Done {
            return Err(GpuError::InvalidImage(format!(
                "run stopped at {} before producing ratio images",
                self.state
            )));
        }
        match (self.first.take(), self.second.take()) {
            (Some(first), Some(second)) => Ok(RatioImages {
                dims: self.image.dims,
                first,
                second,
            }),
            _ => Err(GpuError::BufferReleased(Slot::Scalar.name())),
        }
    }
}

fn bound<T>(binding: &Option<T>, kernel: Kernel) -> Result<&T, GpuError> {
    binding.as_ref().ok_or_else(|| {
        GpuError::native(
            super::error::CODE_VALIDATION,
            format!("enqueue {}", kernel),
            "kernel arguments are not bound",
        )
    })
}

/// Run the pipeline and reduce both ratio images to the final mask.
pub fn process_image<B: ComputeBackend>(
    backend: &B,
    image: PixelImage<'_>,
    options: &MaskOptions,
) -> Result<ShadowMask, GpuError> {
    let ratios = KernelPipeline::new(backend).run(image)?;

    let first = binarize(&to_gray_image(&ratios.first, &ratios.dims)?, options.threshold);
    let second = binarize(&to_gray_image(&ratios.second, &ratios.dims)?, options.threshold);
    join(&first, &second)
}
