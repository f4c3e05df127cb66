//! Dispatch geometry for the 1-D shadow-ratio kernels.

use crate::gpu::error::GpuError;

/// Maximum workgroups per dimension (GPU limit)
pub(crate) const MAX_WORKGROUPS_PER_DIM: u32 = 65535;

/// Round `value` up to the next multiple of `multiple`.
pub fn round_up(value: u32, multiple: u32) -> u32 {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

/// Workgroup grid `(x, y)` covering `work_items` invocations.
///
/// Stays 1-D while the workgroup count fits one dimension, otherwise splits
/// into a roughly square 2-D grid. Kernels linearise with
/// `gid.y * num_workgroups.x * workgroup_size + gid.x` and bounds-check.
pub fn dispatch_dims(work_items: u32, workgroup_size: u32) -> Result<(u32, u32), GpuError> {
    let global = round_up(work_items.max(1), workgroup_size.max(1)) as u64;
    let total_workgroups = (global / workgroup_size.max(1) as u64) as u32;

    if total_workgroups <= MAX_WORKGROUPS_PER_DIM {
        return Ok((total_workgroups, 1));
    }

    let side = ((total_workgroups as f64).sqrt().ceil() as u32).min(MAX_WORKGROUPS_PER_DIM);
    let workgroups_y = total_workgroups.div_ceil(side);

    if workgroups_y > MAX_WORKGROUPS_PER_DIM {
        return Err(GpuError::InvalidImage(format!(
            "{} work items need {} workgroups, more than a 2-D dispatch can address",
            work_items, total_workgroups
        )));
    }

    Ok((side, workgroups_y))
}
