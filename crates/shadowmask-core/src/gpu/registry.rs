//! Platform and device discovery.
//!
//! The registry takes one snapshot of what the driver stack exposes. Selection
//! only borrows from that snapshot, so selecting again never leaks anything.

use std::fmt;

use serde::Deserialize;
use tracing::{debug, warn};

use super::backend::DeviceKind;
use super::error::GpuError;

/// A device as reported during enumeration.
pub trait DeviceHandle {
    fn name(&self) -> String;
    fn kind(&self) -> DeviceKind;
    /// Whether the device can run the image kernels at all.
    fn supports_images(&self) -> bool;
}

/// Something that can list compute platforms and their devices.
pub trait PlatformSource {
    type Device: DeviceHandle;

    /// Names of all platforms, in index order.
    fn platforms(&self) -> Result<Vec<String>, GpuError>;

    /// Devices of one platform, in index order.
    fn devices(&self, platform: usize) -> Result<Vec<Self::Device>, GpuError>;
}

/// Which device types count during enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Discrete, integrated and virtual GPUs.
    Gpu,
    /// CPU implementations only.
    Cpu,
    /// GPUs, or CPU devices on platforms without any GPU.
    #[default]
    Auto,
}

impl DeviceClass {
    fn keeps(self, kind: DeviceKind) -> bool {
        match self {
            DeviceClass::Gpu | DeviceClass::Auto => kind != DeviceKind::Cpu,
            DeviceClass::Cpu => kind == DeviceKind::Cpu,
        }
    }

    /// Filter one platform's devices, preserving order.
    pub fn filter<D: DeviceHandle>(self, devices: Vec<D>) -> Vec<D> {
        let any_gpu = devices.iter().any(|d| d.kind() != DeviceKind::Cpu);
        if self == DeviceClass::Auto && !any_gpu {
            return devices;
        }
        devices.into_iter().filter(|d| self.keeps(d.kind())).collect()
    }
}

struct PlatformEntry<D> {
    name: String,
    devices: Vec<D>,
    error: Option<String>,
}

/// Snapshot of the platforms and devices a [`PlatformSource`] exposes.
pub struct DeviceRegistry<S: PlatformSource> {
    source: S,
    class: DeviceClass,
    platforms: Vec<PlatformEntry<S::Device>>,
}

impl<S: PlatformSource> DeviceRegistry<S> {
    /// Enumerate every platform and its devices.
    ///
    /// Only a failure to list platforms is fatal. A platform whose devices
    /// cannot be queried keeps its index and reports no devices.
    pub fn enumerate(source: S, class: DeviceClass) -> Result<Self, GpuError> {
        let names = source.platforms()?;
        debug!(count = names.len(), class = ?class, "found platforms");

        let mut platforms = Vec::with_capacity(names.len());
        for (index, name) in names.into_iter().enumerate() {
            let entry = match source.devices(index) {
                Ok(devices) => {
                    let devices = class.filter(devices);
                    debug!(platform = index, name = %name, devices = devices.len(), "enumerated platform");
                    PlatformEntry {
                        name,
                        devices,
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(platform = index, name = %name, error = %err, "platform not supported by this build");
                    PlatformEntry {
                        name,
                        devices: Vec::new(),
                        error: Some(err.to_string()),
                    }
                }
            };
            platforms.push(entry);
        }

        Ok(Self {
            source,
            class,
            platforms,
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn platform_count(&self) -> usize {
        self.platforms.len()
    }

    /// Devices kept for a platform.
    pub fn devices(&self, platform: usize) -> Result<&[S::Device], GpuError> {
        self.platforms
            .get(platform)
            .map(|p| p.devices.as_slice())
            .ok_or(GpuError::NoPlatform {
                index: platform,
                available: self.platforms.len(),
            })
    }

    /// Pick one device by index.
    pub fn select(&self, platform: usize, device: usize) -> Result<&S::Device, GpuError> {
        let devices = self.devices(platform)?;
        let selected = devices.get(device).ok_or(GpuError::NoDevice {
            platform,
            index: device,
            available: devices.len(),
        })?;

        if !selected.supports_images() {
            return Err(GpuError::ImageNotSupported {
                device: selected.name(),
            });
        }

        debug!(platform, device, name = %selected.name(), kind = %selected.kind(), "selected device");
        Ok(selected)
    }

    /// Human-readable report of everything enumerated.
    pub fn listing(&self) -> Vec<PlatformReport> {
        self.platforms
            .iter()
            .enumerate()
            .map(|(index, p)| PlatformReport {
                index,
                name: p.name.clone(),
                devices: p
                    .devices
                    .iter()
                    .enumerate()
                    .map(|(index, d)| DeviceReport {
                        index,
                        name: d.name(),
                        kind: d.kind(),
                        supports_images: d.supports_images(),
                    })
                    .collect(),
                error: p.error.clone(),
            })
            .collect()
    }
}

/// One platform in a device listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformReport {
    pub index: usize,
    pub name: String,
    pub devices: Vec<DeviceReport>,
    /// Why device enumeration failed, if it did.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub index: usize,
    pub name: String,
    pub kind: DeviceKind,
    pub supports_images: bool,
}

impl fmt::Display for PlatformReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Platform {}: {}", self.index, self.name)?;
        if let Some(error) = &self.error {
            writeln!(f, "  not supported by this build: {}", error)?;
            return Ok(());
        }
        writeln!(f, "  {} device(s)", self.devices.len())?;
        for device in &self.devices {
            write!(f, "  Device {}: {} ({})", device.index, device.name, device.kind)?;
            if !device.supports_images {
                write!(f, " [no compute support]")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
