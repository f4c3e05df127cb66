//! Error taxonomy for the accelerator pipeline.

use std::path::PathBuf;

use thiserror::Error;

use super::backend::DeviceKind;
use super::pipeline::PipelineState;

/// Native code reported when the driver rejects a call as invalid.
pub const CODE_VALIDATION: i32 = -1;
/// Native code reported when the device runs out of memory.
pub const CODE_OUT_OF_MEMORY: i32 = -2;
/// Native code reported when the device is lost mid-run.
pub const CODE_DEVICE_LOST: i32 = -3;
/// Native code reported when a staging buffer cannot be mapped for readback.
pub const CODE_MAP_FAILED: i32 = -4;
/// Native code for driver-internal failures.
pub const CODE_INTERNAL: i32 = -5;

/// Errors that can occur while discovering devices or running the pipeline.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("platform discovery failed: {0}")]
    PlatformDiscoveryFailed(String),

    #[error("no platform at index {index} ({available} available)")]
    NoPlatform { index: usize, available: usize },

    #[error("no device at index {index} on platform {platform} ({available} available)")]
    NoDevice {
        platform: usize,
        index: usize,
        available: usize,
    },

    #[error("device '{device}' does not support image compute kernels")]
    ImageNotSupported { device: String },

    #[error("no buffer allocation strategy for device type {kind}")]
    UnsupportedDeviceType { kind: DeviceKind },

    #[error("kernel set '{kernel_set}' failed to compile: {log}")]
    KernelCompileError { kernel_set: String, log: String },

    #[error("kernel source {} is unreadable: {reason}", path.display())]
    KernelSourceUnreadable { path: PathBuf, reason: String },

    #[error("allocation of {what} failed: {reason}")]
    AllocationFailed { what: String, reason: String },

    #[error("{operation} failed with code {code}: {message}")]
    NativeCallFailed {
        code: i32,
        operation: String,
        message: String,
    },

    #[error("buffer {slot} is {actual} bytes, expected {expected}")]
    BufferSizeMismatch {
        slot: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("buffer {0} was used after release")]
    BufferReleased(&'static str),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("pipeline failed entering {stage}: {source}")]
    Stage {
        stage: PipelineState,
        #[source]
        source: Box<GpuError>,
    },
}

impl GpuError {
    pub fn native(code: i32, operation: impl Into<String>, message: impl Into<String>) -> Self {
        GpuError::NativeCallFailed {
            code,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Map an error popped from a wgpu error scope.
    pub(crate) fn from_wgpu(operation: &str, err: wgpu::Error) -> Self {
        #[allow(unreachable_patterns)]
        let code = match &err {
            wgpu::Error::OutOfMemory { .. } => CODE_OUT_OF_MEMORY,
            wgpu::Error::Validation { .. } => CODE_VALIDATION,
            _ => CODE_INTERNAL,
        };
        GpuError::native(code, operation, err.to_string())
    }

    /// Tag an error with the pipeline state that was being entered.
    ///
    /// Errors that already carry a stage keep the innermost one.
    pub(crate) fn at_stage(self, stage: PipelineState) -> Self {
        match self {
            GpuError::Stage { .. } => self,
            other => GpuError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Native code for diagnostics, when the failure came from a driver call.
    pub fn native_code(&self) -> Option<i32> {
        match self {
            GpuError::NativeCallFailed { code, .. } => Some(*code),
            GpuError::Stage { source, .. } => source.native_code(),
            _ => None,
        }
    }

    /// Pipeline state that failed, if the error came out of a run.
    pub fn stage(&self) -> Option<PipelineState> {
        match self {
            GpuError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Innermost error with any stage tagging removed.
    pub fn root(&self) -> &GpuError {
        match self {
            GpuError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}
