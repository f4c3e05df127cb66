//! Reduction of ratio images to a binary shadow mask.

use std::fmt;
use std::str::FromStr;

use image::{GrayImage, Luma};
use serde::Deserialize;

use crate::gpu::GpuError;
use crate::models::ImageDims;


/// Value written for mask pixels classified as shadow.
pub const SHADOW: u8 = 255;

/// How a ratio image is split into shadow and non-shadow pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "ThresholdRepr")]
pub enum Threshold {
    /// Pick the level that maximises between-class variance.
    #[default]
    Otsu,
    /// Pixels strictly above this level are shadow.
    Fixed(u8),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ThresholdRepr {
    Level(i64),
    Name(String),
}

impl TryFrom<ThresholdRepr> for Threshold {
    type Error = String;

    fn try_from(repr: ThresholdRepr) -> Result<Self, Self::Error> {
        match repr {
            ThresholdRepr::Level(level) => u8::try_from(level)
                .map(Threshold::Fixed)
                .map_err(|_| format!("threshold {} is outside 0..=255", level)),
            ThresholdRepr::Name(name) => name.parse(),
        }
    }
}

impl FromStr for Threshold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("otsu") {
            return Ok(Threshold::Otsu);
        }
        s.parse::<u8>()
            .map(Threshold::Fixed)
            .map_err(|_| format!("invalid threshold '{}': expected 'otsu' or 0..=255", s))
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Otsu => f.write_str("otsu"),
            Threshold::Fixed(level) => write!(f, "{}", level),
        }
    }
}

/// Single-channel mask holding only `0` and [`SHADOW`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    image: GrayImage,
}

impl BinaryMask {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_shadow(&self, x: u32, y: u32) -> bool {
        self.image.get_pixel(x, y)[0] == SHADOW
    }

    /// Number of shadow pixels.
    pub fn shadow_count(&self) -> usize {
        self.image.as_raw().iter().filter(|&&v| v == SHADOW).count()
    }

    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn as_image(&self) -> &GrayImage {
        &self.image
    }

    pub fn into_image(self) -> GrayImage {
        self.image
    }
}

/// Wrap a ratio image as an 8-bit grayscale image.
pub fn to_gray_image(ratio: &[u8], dims: &ImageDims) -> Result<GrayImage, GpuError> {
    GrayImage::from_raw(dims.width, dims.height, ratio.to_vec()).ok_or_else(|| {
        GpuError::InvalidImage(format!(
            "ratio image holds {} bytes, expected {} for {}x{}",
            ratio.len(),
            dims.pixel_count(),
            dims.width,
            dims.height
        ))
    })
}

/// Otsu threshold of an 8-bit image.
///
/// Returns the lowest level with the largest between-class variance. A
/// single-level image has no split and returns that level, so binarising it
/// marks nothing.
pub fn otsu_threshold(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in image.as_raw() {
        histogram[*pixel as usize] += 1;
    }

    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0;
    }
    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(level, &count)| level as f64 * count as f64)
        .sum();

    let mut best_level = None;
    let mut best_variance = 0.0f64;
    let mut background = 0u64;
    let mut weighted_background = 0.0f64;

    for (level, &count) in histogram.iter().enumerate() {
        background += count;
        if background == 0 {
            continue;
        }
        let foreground = total - background;
        if foreground == 0 {
            break;
        }
        weighted_background += level as f64 * count as f64;

        let mean_background = weighted_background / background as f64;
        let mean_foreground = (weighted_total - weighted_background) / foreground as f64;
        let diff = mean_background - mean_foreground;
        let variance = background as f64 * foreground as f64 * diff * diff;

        if variance > best_variance {
            best_variance = variance;
            best_level = Some(level as u8);
        }
    }

    best_level.unwrap_or_else(|| {
        image
            .as_raw()
            .iter()
            .copied()
            .max()
            .unwrap_or(0)
    })
}

/// Classify every pixel of a ratio image.
pub fn binarize(image: &GrayImage, threshold: Threshold) -> BinaryMask {
    let level = match threshold {
        Threshold::Otsu => otsu_threshold(image),
        Threshold::Fixed(level) => level,
    };

    let mut out = GrayImage::new(image.width(), image.height());
    for (src, dst) in image.pixels().zip(out.pixels_mut()) {
        *dst = Luma([if src[0] > level { SHADOW } else { 0 }]);
    }
    BinaryMask { image: out }
}

/// Combine two masks: a pixel is shadow when either mask marks it.
pub fn join(first: &BinaryMask, second: &BinaryMask) -> Result<BinaryMask, GpuError> {
    if first.width() != second.width() || first.height() != second.height() {
        return Err(GpuError::InvalidImage(format!(
            "cannot join {}x{} mask with {}x{} mask",
            first.width(),
            first.height(),
            second.width(),
            second.height()
        )));
    }

    let joined: Vec<u8> = first
        .as_raw()
        .iter()
        .zip(second.as_raw())
        .map(|(&a, &b)| a | b)
        .collect();

    let image = GrayImage::from_raw(first.width(), first.height(), joined).ok_or_else(|| {
        GpuError::InvalidImage("joined mask has the wrong length".to_string())
    })?;
    Ok(BinaryMask { image })
}
