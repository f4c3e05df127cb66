//! GPU context management for the wgpu device, queue, and kernel pipelines.

mod init;
mod pipelines;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

pub use init::{WgpuDevice, WgpuPlatforms};
pub use pipelines::{CompiledKernels, WgpuProgramBuilder};

use super::backend::{Access, ComputeBackend, DeviceKind, Kernel, Residency, KERNEL_SET};
use super::error::{GpuError, CODE_DEVICE_LOST, CODE_MAP_FAILED, CODE_VALIDATION};
use super::host::binding_extent;
use super::pipeline::dispatch_dims;
use super::program_cache::{ProgramCache, ProgramOrigin};
use super::registry::DeviceRegistry;
use crate::models::{AcceleratorOptions, ImageDims};

/// Kernel parameters, matching `Params` in the WGSL source.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct KernelParams {
    width: u32,
    height: u32,
    channels: u32,
    pixel_count: u32,
}

/// Run `f` inside validation and out-of-memory error scopes.
fn with_error_scope<T>(
    device: &wgpu::Device,
    operation: &str,
    f: impl FnOnce() -> T,
) -> Result<T, GpuError> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());

    match out_of_memory.or(validation) {
        Some(err) => Err(GpuError::from_wgpu(operation, err)),
        None => Ok(value),
    }
}

/// Padded device size for a logical byte length.
fn device_size(len: u64) -> u64 {
    len.max(4).div_ceil(4) * 4
}

/// A device buffer with its logical (unpadded) length.
pub struct DeviceBuffer {
    buffer: wgpu::Buffer,
    len: u64,
}

/// Bind group for one kernel invocation.
pub struct WgpuBinding {
    kernel: Kernel,
    bind_group: wgpu::BindGroup,
    _params: wgpu::Buffer,
}

/// GPU context holding the wgpu device, queue, and compiled kernels.
///
/// A context exists only once every kernel has been built. Fields drop in
/// declaration order, so the instance is released last.
pub struct GpuContext {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    kernels: CompiledKernels,
    adapter_info: wgpu::AdapterInfo,
    origin: ProgramOrigin,
    lost: Arc<AtomicBool>,
    _adapter: Arc<wgpu::Adapter>,
    _instance: Arc<wgpu::Instance>,
}

impl GpuContext {
    /// Check if a compute-capable adapter exists without creating a device.
    pub fn is_available() -> bool {
        init::is_available()
    }

    /// Get information about the preferred adapter.
    pub fn device_info() -> Option<String> {
        init::device_info()
    }

    /// Enumerate devices and open the one `options` selects.
    pub fn from_options(options: &AcceleratorOptions) -> Result<Self, GpuError> {
        let registry = DeviceRegistry::enumerate(WgpuPlatforms::new(), options.device_class)?;
        Self::open(&registry, options.platform_index, options.device_index, options)
    }

    /// Select a device, create its queue, and load the kernel program.
    pub fn open(
        registry: &DeviceRegistry<WgpuPlatforms>,
        platform: usize,
        device: usize,
        options: &AcceleratorOptions,
    ) -> Result<Self, GpuError> {
        let selected = registry.select(platform, device)?;
        let (device, queue) = pollster::block_on(init::request_device(&selected.adapter))?;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            warn!(?reason, %message, "device lost");
            flag.store(true, Ordering::SeqCst);
        });

        let programs = ProgramCache::from_options(options);
        let builder = WgpuProgramBuilder::new(&device, &selected.info);
        let (kernels, origin) = programs.ensure_program(&builder, KERNEL_SET)?;

        info!(
            device = %selected.info.name,
            backend = ?selected.info.backend,
            kind = ?selected.info.device_type,
            origin = ?origin,
            work_group_size = kernels.work_group_sizes[0],
            "opened GPU context"
        );

        Ok(Self {
            device,
            queue,
            kernels,
            adapter_info: selected.info.clone(),
            origin,
            lost,
            _adapter: Arc::clone(&selected.adapter),
            _instance: Arc::clone(&selected.instance),
        })
    }

    /// Get the adapter info for this context.
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Where the kernel program came from.
    pub fn program_origin(&self) -> ProgramOrigin {
        self.origin
    }

    /// Workgroup size the kernel is dispatched with.
    pub fn work_group_size(&self, kernel: Kernel) -> u32 {
        self.kernels.work_group_sizes[kernel.index()]
    }

    fn check_alive(&self, operation: &str) -> Result<(), GpuError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(GpuError::native(CODE_DEVICE_LOST, operation, "device was lost"));
        }
        Ok(())
    }

    fn allocate(
        &self,
        label: &'static str,
        len: u64,
        usage: wgpu::BufferUsages,
        mapped_at_creation: bool,
    ) -> Result<wgpu::Buffer, GpuError> {
        with_error_scope(&self.device, label, || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: device_size(len),
                usage,
                mapped_at_creation,
            })
        })
        .map_err(|err| GpuError::AllocationFailed {
            what: label.to_string(),
            reason: err.to_string(),
        })
    }
}

impl ComputeBackend for GpuContext {
    type Buffer = DeviceBuffer;
    type Binding = WgpuBinding;

    fn device_kind(&self) -> DeviceKind {
        self.adapter_info.device_type.into()
    }

    fn create_input(
        &self,
        label: &'static str,
        pixels: &[u8],
        residency: Residency,
    ) -> Result<DeviceBuffer, GpuError> {
        self.check_alive(label)?;
        let len = pixels.len() as u64;
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;

        let buffer = match residency {
            Residency::Copied => {
                let buffer = self.allocate(label, len, usage, false)?;
                let mut padded = pixels.to_vec();
                padded.resize(device_size(len) as usize, 0);
                self.queue.write_buffer(&buffer, 0, &padded);
                buffer
            }
            Residency::Mapped => {
                let buffer = self.allocate(label, len, usage, true)?;
                buffer.slice(..).get_mapped_range_mut()[..pixels.len()].copy_from_slice(pixels);
                buffer.unmap();
                buffer
            }
        };

        Ok(DeviceBuffer { buffer, len })
    }

    fn create_output(
        &self,
        label: &'static str,
        len: u64,
        access: Access,
        _residency: Residency,
    ) -> Result<DeviceBuffer, GpuError> {
        self.check_alive(label)?;
        let mut usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC;
        if access == Access::ReadWrite {
            usage |= wgpu::BufferUsages::COPY_DST;
        }
        let buffer = self.allocate(label, len, usage, false)?;
        Ok(DeviceBuffer { buffer, len })
    }

    fn buffer_len(&self, buffer: &DeviceBuffer) -> u64 {
        buffer.len
    }

    fn bind(
        &self,
        kernel: Kernel,
        src: &DeviceBuffer,
        dst: &DeviceBuffer,
        dims: &ImageDims,
    ) -> Result<WgpuBinding, GpuError> {
        let operation = format!("bind {}", kernel);
        let (needs_src, needs_dst) = binding_extent(kernel, dims);
        if src.len < needs_src || dst.len < needs_dst {
            return Err(GpuError::native(
                CODE_VALIDATION,
                operation,
                format!(
                    "buffers too small: src {} < {} or dst {} < {}",
                    src.len, needs_src, dst.len, needs_dst
                ),
            ));
        }

        let params = KernelParams {
            width: dims.width,
            height: dims.height,
            channels: dims.channels as u32,
            pixel_count: dims.pixel_count() as u32,
        };

        with_error_scope(&self.device, &operation, || {
            let params = self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("kernel_params"),
                    contents: bytemuck::bytes_of(&params),
                    usage: wgpu::BufferUsages::UNIFORM,
                });

            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(kernel.entry_point()),
                layout: &self.kernels.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: src.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: dst.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: params.as_entire_binding(),
                    },
                ],
            });

            WgpuBinding {
                kernel,
                bind_group,
                _params: params,
            }
        })
    }

    fn enqueue(
        &self,
        kernel: Kernel,
        binding: &WgpuBinding,
        work_items: u32,
    ) -> Result<(), GpuError> {
        let operation = format!("enqueue {}", kernel);
        self.check_alive(&operation)?;
        if binding.kernel != kernel {
            return Err(GpuError::native(
                CODE_VALIDATION,
                operation,
                format!("binding was created for {}", binding.kernel),
            ));
        }

        let (x, y) = dispatch_dims(work_items, self.work_group_size(kernel))?;
        debug!(kernel = %kernel, work_items, x, y, "dispatch");

        with_error_scope(&self.device, &operation, || {
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(kernel.entry_point()),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(kernel.entry_point()),
                    timestamp_writes: None,
                });
                pass.set_pipeline(self.kernels.pipeline(kernel));
                pass.set_bind_group(0, &binding.bind_group, &[]);
                pass.dispatch_workgroups(x, y, 1);
            }
            self.queue.submit(std::iter::once(encoder.finish()));
        })
    }

    fn finish(&self) -> Result<(), GpuError> {
        self.device.poll(wgpu::Maintain::Wait);
        self.check_alive("finish")
    }

    fn read_back(&self, buffer: &DeviceBuffer, len: usize) -> Result<Vec<u8>, GpuError> {
        if len as u64 > buffer.len {
            return Err(GpuError::native(
                CODE_VALIDATION,
                "read back",
                format!("requested {} bytes from a {} byte buffer", len, buffer.len),
            ));
        }
        let size = device_size(len as u64);

        // Create staging buffer for readback
        let staging = with_error_scope(&self.device, "read back", || {
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("staging_readback"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("readback_encoder"),
                });
            encoder.copy_buffer_to_buffer(&buffer.buffer, 0, &staging, 0, size);
            self.queue.submit(std::iter::once(encoder.finish()));
            staging
        })?;

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // Ignore send error - if receiver is dropped, the recv() call will fail appropriately
            let _ = tx.send(result);
        });

        self.device.poll(wgpu::Maintain::Wait);
        self.check_alive("read back")?;

        rx.recv()
            .map_err(|e| GpuError::native(CODE_MAP_FAILED, "map staging buffer", e.to_string()))?
            .map_err(|e| GpuError::native(CODE_MAP_FAILED, "map staging buffer", e.to_string()))?;

        let data = slice.get_mapped_range();
        let result = data[..len].to_vec();
        drop(data);
        staging.unmap();
        staging.destroy();

        Ok(result)
    }

    fn release(&self, buffer: DeviceBuffer) {
        buffer.buffer.destroy();
    }
}
