//! Adapter enumeration and device initialization.

use std::sync::Arc;

use crate::gpu::backend::DeviceKind;
use crate::gpu::error::{GpuError, CODE_INTERNAL};
use crate::gpu::registry::{DeviceHandle, PlatformSource};

/// Backends exposed as platforms, in index order.
const PLATFORM_BACKENDS: [wgpu::Backend; 4] = [
    wgpu::Backend::Vulkan,
    wgpu::Backend::Metal,
    wgpu::Backend::Dx12,
    wgpu::Backend::Gl,
];

fn new_instance() -> wgpu::Instance {
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

/// wgpu backends as compute platforms.
///
/// Each backend with at least one adapter is a platform; its adapters are the
/// platform's devices.
pub struct WgpuPlatforms {
    instance: Arc<wgpu::Instance>,
    backends: Vec<wgpu::Backend>,
}

impl WgpuPlatforms {
    pub fn new() -> Self {
        let instance = new_instance();
        let adapters = instance.enumerate_adapters(wgpu::Backends::all());
        let backends = PLATFORM_BACKENDS
            .into_iter()
            .filter(|backend| adapters.iter().any(|a| a.get_info().backend == *backend))
            .collect();

        Self {
            instance: Arc::new(instance),
            backends,
        }
    }
}

impl Default for WgpuPlatforms {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformSource for WgpuPlatforms {
    type Device = WgpuDevice;

    fn platforms(&self) -> Result<Vec<String>, GpuError> {
        if self.backends.is_empty() {
            return Err(GpuError::PlatformDiscoveryFailed(
                "no wgpu backend exposes an adapter".to_string(),
            ));
        }
        Ok(self.backends.iter().map(|b| format!("{:?}", b)).collect())
    }

    fn devices(&self, platform: usize) -> Result<Vec<WgpuDevice>, GpuError> {
        let backend = *self.backends.get(platform).ok_or(GpuError::NoPlatform {
            index: platform,
            available: self.backends.len(),
        })?;

        Ok(self
            .instance
            .enumerate_adapters(backend.into())
            .into_iter()
            .map(|adapter| WgpuDevice::new(adapter, Arc::clone(&self.instance)))
            .collect())
    }
}

/// One wgpu adapter.
#[derive(Clone)]
pub struct WgpuDevice {
    pub(crate) adapter: Arc<wgpu::Adapter>,
    pub(crate) info: wgpu::AdapterInfo,
    compute: bool,
    pub(crate) instance: Arc<wgpu::Instance>,
}

impl WgpuDevice {
    fn new(adapter: wgpu::Adapter, instance: Arc<wgpu::Instance>) -> Self {
        let info = adapter.get_info();
        let compute = adapter
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS);
        Self {
            adapter: Arc::new(adapter),
            info,
            compute,
            instance,
        }
    }

    pub fn info(&self) -> &wgpu::AdapterInfo {
        &self.info
    }
}

impl DeviceHandle for WgpuDevice {
    fn name(&self) -> String {
        self.info.name.clone()
    }

    fn kind(&self) -> DeviceKind {
        self.info.device_type.into()
    }

    fn supports_images(&self) -> bool {
        self.compute
    }
}

/// Request a device and queue from an adapter.
///
/// Pipeline caching is enabled when the adapter supports it, so compiled
/// programs can be persisted.
pub async fn request_device(
    adapter: &wgpu::Adapter,
) -> Result<(wgpu::Device, wgpu::Queue), GpuError> {
    adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("shadowmask-gpu"),
                required_features: adapter.features() & wgpu::Features::PIPELINE_CACHE,
                // Large images need the adapter's full storage binding size.
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        )
        .await
        .map_err(|e| GpuError::native(CODE_INTERNAL, "request device", e.to_string()))
}

/// Check if a compute-capable adapter is available without creating a device.
pub fn is_available() -> bool {
    let instance = new_instance();
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .iter()
        .any(|adapter| {
            adapter
                .get_downlevel_capabilities()
                .flags
                .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
        })
}

/// Get information about the preferred adapter.
pub fn device_info() -> Option<String> {
    let instance = new_instance();

    pollster::block_on(async {
        instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map(|adapter| {
                let info = adapter.get_info();
                format!("{} ({:?}, {:?})", info.name, info.device_type, info.backend)
            })
    })
}
