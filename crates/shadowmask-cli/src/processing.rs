//! Input handling, config overrides and single-image detection.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use tracing::debug;

use shadowmask_core::{
    load_config, process_image, ComputeBackend, DeviceClass, PixelImage, ShadowmaskConfig,
    Threshold,
};

/// Image extensions picked up when a directory is given as input.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff"];

/// Command-line settings that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub platform: Option<usize>,
    pub device: Option<usize>,
    pub class: Option<DeviceClass>,
    pub no_precompiled: bool,
    pub threshold: Option<Threshold>,
}

/// Load the config file and apply command-line overrides on top of it.
pub fn resolve_config(overrides: &Overrides) -> ShadowmaskConfig {
    let handle = load_config(overrides.config.as_deref());
    handle.log_usage();

    let mut config = handle.config;
    if let Some(platform) = overrides.platform {
        config.accelerator.platform_index = platform;
    }
    if let Some(device) = overrides.device {
        config.accelerator.device_index = device;
    }
    if let Some(class) = overrides.class {
        config.accelerator.device_class = class;
    }
    if overrides.no_precompiled {
        config.accelerator.use_precompiled_kernels = false;
    }
    if let Some(threshold) = overrides.threshold {
        config.mask.threshold = threshold;
    }
    config
}

/// Decode an image file into interleaved 8-bit RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let image = image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(image.to_rgb8())
}

/// Run detection for one file and write the mask as PNG.
///
/// Returns the number of shadow pixels.
pub fn detect_file<B: ComputeBackend>(
    backend: &B,
    input: &Path,
    output: &Path,
    config: &ShadowmaskConfig,
) -> Result<usize> {
    let rgb = load_rgb(input)?;
    let (width, height) = rgb.dimensions();
    debug!(input = %input.display(), width, height, "decoded image");

    let pixels = PixelImage::new(rgb.as_raw(), width, height, 3)?;
    let mask = process_image(backend, pixels, &config.mask)
        .with_context(|| format!("shadow detection failed for {}", input.display()))?;
    let shadow_pixels = mask.shadow_count();

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    mask.into_image()
        .save_with_format(output, image::ImageFormat::Png)
        .with_context(|| format!("failed to write {}", output.display()))?;

    Ok(shadow_pixels)
}

/// Determine where the mask for `input` is written.
///
/// A directory `out` receives `<stem>_mask.png`; any other `out` is used as-is.
/// Without `out` the mask lands next to the input.
pub fn determine_output_path(input: &Path, out: Option<&Path>) -> Result<PathBuf> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("invalid input filename: {}", input.display()))?
        .to_string_lossy();
    let filename = format!("{}_mask.png", stem);

    match out {
        Some(out_path) if out_path.is_dir() => Ok(out_path.join(filename)),
        Some(out_path) => Ok(out_path.to_path_buf()),
        None => {
            let parent = input.parent().unwrap_or(Path::new("."));
            Ok(parent.join(filename))
        }
    }
}

/// Expand files and directories into a sorted list of image files.
pub fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for input in inputs {
        if input.is_dir() {
            let entries = std::fs::read_dir(input)
                .with_context(|| format!("failed to read directory {}", input.display()))?;
            for entry in entries {
                let path = entry?.path();
                if path.is_file() && is_supported(&path) {
                    files.push(path);
                }
            }
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            bail!("path not found: {}", input.display());
        }
    }

    files.sort();
    Ok(files)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
