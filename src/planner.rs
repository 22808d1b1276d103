use crate::resampler::ResampleError;

/// Desired output spacing, in the physical units of the volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpacingSpec {
    Isotropic(f64),
    Anisotropic([f64; 3]),
}

impl SpacingSpec {
    /// Build a spacing from one (isotropic) or three (x, y, z) values.
    pub fn from_values(values: &[f64]) -> Result<Self, ResampleError> {
        let spec = match *values {
            [spacing] => SpacingSpec::Isotropic(spacing),
            [x, y, z] => SpacingSpec::Anisotropic([x, y, z]),
            _ => {
                return Err(ResampleError::InvalidSpacing(format!(
                    "expected one or three spacing values, got {}",
                    values.len()
                )));
            }
        };
        spec.validated()
    }

    /// The spacing broadcast to `[x, y, z]`.
    pub fn per_axis(&self) -> [f64; 3] {
        match *self {
            SpacingSpec::Isotropic(spacing) => [spacing; 3],
            SpacingSpec::Anisotropic(spacing) => spacing,
        }
    }

    fn validated(self) -> Result<Self, ResampleError> {
        let spacing = self.per_axis();
        if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ResampleError::InvalidSpacing(format!(
                "spacing values must be positive, got {spacing:?}"
            )));
        }
        Ok(self)
    }
}

impl From<f64> for SpacingSpec {
    fn from(spacing: f64) -> Self {
        SpacingSpec::Isotropic(spacing)
    }
}

impl From<[f64; 3]> for SpacingSpec {
    fn from(spacing: [f64; 3]) -> Self {
        SpacingSpec::Anisotropic(spacing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResamplePlan {
    pub target_size: [usize; 3],
    /// The target size equals the current size; resampling must be skipped.
    pub is_noop: bool,
}

/// Compute the integer grid that best realises `desired` spacing.
///
/// Each axis becomes `size * (spacing / desired)` rounded half to even, so
/// that an exact half-voxel tie resolves the same way for every caller.
pub fn plan(
    size: [usize; 3],
    spacing: [f64; 3],
    desired: &SpacingSpec,
) -> Result<ResamplePlan, ResampleError> {
    let desired = desired.validated()?.per_axis();

    let mut target_size = [0usize; 3];
    for axis in 0..3 {
        let extent = size[axis] as f64 * (spacing[axis] / desired[axis]);
        let target = extent.round_ties_even();
        if !target.is_finite() || target < 1.0 {
            return Err(ResampleError::InvalidSpacing(format!(
                "spacing {} leaves no voxels along axis {axis} (extent {extent})",
                desired[axis]
            )));
        }
        target_size[axis] = target as usize;
    }
    if voxel_count(target_size).is_none() {
        return Err(ResampleError::InvalidSpacing(format!(
            "spacing {desired:?} asks for a {target_size:?} grid, too large to allocate"
        )));
    }

    Ok(ResamplePlan {
        target_size,
        is_noop: target_size == size,
    })
}

/// Number of voxels in a grid of `size`, or `None` when the grid could not be
/// held in memory even as a single buffer of `f64` samples.
pub fn voxel_count(size: [usize; 3]) -> Option<usize> {
    let count = size.iter().try_fold(1usize, |count, &n| count.checked_mul(n))?;
    let bytes = count.checked_mul(size_of::<f64>())?;
    (bytes <= isize::MAX as usize).then_some(count)
}

/// The spacing actually realised on a grid of `target_size` voxels covering
/// the same extent as `size` voxels of `spacing`.
pub fn achieved_spacing(spacing: [f64; 3], size: [usize; 3], target_size: [usize; 3]) -> [f64; 3] {
    std::array::from_fn(|axis| spacing[axis] * (size[axis] as f64 / target_size[axis] as f64))
}
