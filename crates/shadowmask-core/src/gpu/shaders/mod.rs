//! WGSL shader sources embedded at compile time.

use super::backend::KERNEL_SET;

/// Name of the override constant every entry point sizes its workgroup with.
pub const WORKGROUP_SIZE_CONSTANT: &str = "WORKGROUP_SIZE";

/// Container for all shader source code.
pub struct Shaders;

impl Shaders {
    /// Colour conversions and the Tsai ratio (`hsi_convert1`, `hsi_convert2`, `tsai_ratio`).
    pub const SHADOW_RATIO: &'static str = include_str!("shadow_ratio.wgsl");
}

/// Embedded source of a kernel set.
pub fn source_for(kernel_set: &str) -> Option<&'static str> {
    (kernel_set == KERNEL_SET).then_some(Shaders::SHADOW_RATIO)
}
