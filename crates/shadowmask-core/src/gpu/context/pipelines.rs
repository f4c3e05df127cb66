//! Compute pipeline creation and program binaries for the wgpu backend.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::with_error_scope;
use crate::gpu::backend::{Kernel, KERNEL_COUNT, KERNEL_SET};
use crate::gpu::error::{GpuError, CODE_INTERNAL, CODE_VALIDATION};
use crate::gpu::program_cache::ProgramBuilder;
use crate::gpu::shaders::WORKGROUP_SIZE_CONSTANT;

/// Bumped whenever the artifact layout or kernel interface changes.
const ARTIFACT_VERSION: u32 = 1;

/// Largest workgroup the kernels are dispatched with.
pub(crate) const MAX_WORK_GROUP_SIZE: u32 = 256;

/// Persisted form of a compiled program.
#[derive(Debug, Serialize, Deserialize)]
struct ProgramArtifact {
    format_version: u32,
    device_name: String,
    kernel_set: String,
    /// Driver cache key the blob was produced under.
    cache_key: Option<String>,
    source: String,
    pipeline_cache: Option<Vec<u8>>,
}

/// All kernels of the shadow-ratio program, ready to dispatch.
pub struct CompiledKernels {
    pipelines: Vec<wgpu::ComputePipeline>,
    pub(crate) layout: wgpu::BindGroupLayout,
    pub(crate) work_group_sizes: [u32; KERNEL_COUNT],
    source: String,
    cache: Option<wgpu::PipelineCache>,
}

impl CompiledKernels {
    pub(crate) fn pipeline(&self, kernel: Kernel) -> &wgpu::ComputePipeline {
        &self.pipelines[kernel.index()]
    }
}

/// Workgroup size for the kernels on a device.
pub(crate) fn work_group_size(limits: &wgpu::Limits) -> u32 {
    MAX_WORK_GROUP_SIZE
        .min(limits.max_compute_workgroup_size_x)
        .min(limits.max_compute_invocations_per_workgroup)
        .max(1)
}

/// Builds [`CompiledKernels`] on one device.
pub struct WgpuProgramBuilder<'d> {
    device: &'d wgpu::Device,
    info: &'d wgpu::AdapterInfo,
    work_group_size: u32,
}

impl<'d> WgpuProgramBuilder<'d> {
    pub fn new(device: &'d wgpu::Device, info: &'d wgpu::AdapterInfo) -> Self {
        Self {
            device,
            info,
            work_group_size: work_group_size(&device.limits()),
        }
    }

    fn caching_supported(&self) -> bool {
        self.device.features().contains(wgpu::Features::PIPELINE_CACHE)
    }

    fn cache_key(&self) -> Option<String> {
        wgpu::util::pipeline_cache_key(self.info)
    }

    fn build(&self, source: &str, cache_data: Option<&[u8]>) -> CompiledKernels {
        let cache = self.caching_supported().then(|| {
            // SAFETY: `cache_data` comes from an untrusted file. wgpu checks the
            // blob header against this adapter and, with `fallback: true`,
            // starts from an empty cache when that check fails.
            unsafe {
                self.device
                    .create_pipeline_cache(&wgpu::PipelineCacheDescriptor {
                        label: Some("shadow_ratio_cache"),
                        data: cache_data,
                        fallback: true,
                    })
            }
        });

        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(KERNEL_SET),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });

        let layout = create_kernel_layout(self.device);
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("shadow_ratio_pipeline_layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });

        let constants = HashMap::from([(
            WORKGROUP_SIZE_CONSTANT.to_string(),
            self.work_group_size as f64,
        )]);

        let pipelines = Kernel::ALL
            .iter()
            .map(|kernel| {
                self.device
                    .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                        label: Some(kernel.entry_point()),
                        layout: Some(&pipeline_layout),
                        module: &module,
                        entry_point: Some(kernel.entry_point()),
                        compilation_options: wgpu::PipelineCompilationOptions {
                            constants: &constants,
                            ..Default::default()
                        },
                        cache: cache.as_ref(),
                    })
            })
            .collect();

        CompiledKernels {
            pipelines,
            layout,
            work_group_sizes: [self.work_group_size; KERNEL_COUNT],
            source: source.to_string(),
            cache,
        }
    }
}

impl ProgramBuilder for WgpuProgramBuilder<'_> {
    type Program = CompiledKernels;

    fn device_name(&self) -> Result<String, GpuError> {
        if self.info.name.trim().is_empty() {
            return Err(GpuError::native(
                CODE_INTERNAL,
                "query device name",
                "adapter reports no name",
            ));
        }
        Ok(self.info.name.clone())
    }

    fn build_from_binary(&self, binary: &[u8]) -> Result<CompiledKernels, GpuError> {
        let artifact: ProgramArtifact = bincode::deserialize(binary)
            .map_err(|e| GpuError::native(CODE_VALIDATION, "decode program binary", e.to_string()))?;

        if artifact.format_version != ARTIFACT_VERSION
            || artifact.kernel_set != KERNEL_SET
            || artifact.device_name != self.info.name
        {
            return Err(GpuError::native(
                CODE_VALIDATION,
                "load program binary",
                format!(
                    "binary v{} for '{}' ({}) does not match this device",
                    artifact.format_version, artifact.device_name, artifact.kernel_set
                ),
            ));
        }

        let cache_data = match (&artifact.pipeline_cache, artifact.cache_key == self.cache_key()) {
            (Some(data), true) => Some(data.as_slice()),
            _ => None,
        };

        with_error_scope(self.device, "load program binary", || {
            self.build(&artifact.source, cache_data)
        })
    }

    fn build_from_source(&self, source: &str) -> Result<CompiledKernels, GpuError> {
        with_error_scope(self.device, "compile program", || self.build(source, None)).map_err(
            |err| GpuError::KernelCompileError {
                kernel_set: KERNEL_SET.to_string(),
                log: err.to_string(),
            },
        )
    }

    fn program_binary(&self, program: &CompiledKernels) -> Result<Vec<u8>, GpuError> {
        let artifact = ProgramArtifact {
            format_version: ARTIFACT_VERSION,
            device_name: self.device_name()?,
            kernel_set: KERNEL_SET.to_string(),
            cache_key: self.cache_key(),
            source: program.source.clone(),
            pipeline_cache: program.cache.as_ref().and_then(|c| c.get_data()),
        };
        bincode::serialize(&artifact)
            .map_err(|e| GpuError::native(CODE_INTERNAL, "encode program binary", e.to_string()))
    }
}

/// `(src, dst, params)` layout shared by every kernel.
fn create_kernel_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    };

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("shadow_ratio_layout"),
        entries: &[
            storage(0, true),
            storage(1, false),
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    })
}
