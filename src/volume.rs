use std::fmt;

use ndarray::Array3;

use crate::planner::voxel_count;
use crate::resampler::ResampleError;

/// Identity orientation: index axes aligned with the physical axes.
pub const IDENTITY_DIRECTION: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

const ORTHONORMAL_TOLERANCE: f64 = 1e-4;

/// Numeric voxel type that can pass through the interpolation backends.
///
/// Converting back from the working precision follows `as` semantics:
/// fractional parts are truncated toward zero, values outside the range of
/// the target type saturate and NaN becomes zero.
pub trait Sample: Copy + Default + PartialEq + Send + Sync + fmt::Debug + 'static {
    fn to_f64(self) -> f64;

    fn from_f64(value: f64) -> Self;

    #[inline]
    fn to_f32(self) -> f32 {
        self.to_f64() as f32
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        Self::from_f64(f64::from(value))
    }
}

macro_rules! impl_sample {
    ($($ty:ty),*) => {
        $(
            impl Sample for $ty {
                #[inline]
                fn to_f64(self) -> f64 {
                    self as f64
                }

                #[inline]
                fn from_f64(value: f64) -> Self {
                    value as $ty
                }
            }
        )*
    };
}

impl_sample!(u8, i8, u16, i16, u32, i32, f32, f64);

/// A dense 3D image with its physical geometry.
///
/// `data` is indexed `[z, y, x]` (depth, height, width). `spacing`, `origin`
/// and the columns of `direction` are given in `(x, y, z)` order, so
/// `direction[r][c]` is the `r`-th physical component of index axis `c`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T: Sample = u16> {
    pub data: Array3<T>,
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub direction: [[f64; 3]; 3],
}

impl<T: Sample> Volume<T> {
    pub fn new(data: Array3<T>, spacing: [f64; 3]) -> Self {
        Self {
            data,
            spacing,
            origin: [0.0; 3],
            direction: IDENTITY_DIRECTION,
        }
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_direction(mut self, direction: [[f64; 3]; 3]) -> Self {
        self.direction = direction;
        self
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get the size of the volume as `[width, height, depth]`
    pub fn size(&self) -> [usize; 3] {
        let (depth, height, width) = self.data.dim();
        [width, height, depth]
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<T> {
        &mut self.data
    }

    /// Check that size, spacing, origin and direction describe a usable grid.
    pub fn validate(&self) -> Result<(), ResampleError> {
        let size = self.size();
        if size.contains(&0) {
            return Err(ResampleError::InvalidVolume(format!(
                "size {size:?} has an empty axis"
            )));
        }
        if self.spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ResampleError::InvalidVolume(format!(
                "spacing {:?} must be positive",
                self.spacing
            )));
        }
        if self.origin.iter().any(|o| !o.is_finite()) {
            return Err(ResampleError::InvalidVolume(format!(
                "origin {:?} is not finite",
                self.origin
            )));
        }
        if !is_orthonormal(&self.direction) {
            return Err(ResampleError::InvalidVolume(format!(
                "direction {:?} is not orthonormal",
                self.direction
            )));
        }
        Ok(())
    }

    /// Physical position of a (continuous) index given as `[x, y, z]`.
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        index_to_physical(&self.spacing, &self.origin, &self.direction, index)
    }

    /// Continuous `[x, y, z]` index of a physical position.
    pub fn physical_to_index(&self, point: [f64; 3]) -> [f64; 3] {
        physical_to_index(&self.spacing, &self.origin, &self.direction, point)
    }

    pub fn to_flat_buffer(&self) -> Vec<f32> {
        to_flat_buffer(&self.data)
    }
}

pub(crate) fn index_to_physical(
    spacing: &[f64; 3],
    origin: &[f64; 3],
    direction: &[[f64; 3]; 3],
    index: [f64; 3],
) -> [f64; 3] {
    let scaled = [
        index[0] * spacing[0],
        index[1] * spacing[1],
        index[2] * spacing[2],
    ];
    std::array::from_fn(|r| {
        origin[r] + direction[r][0] * scaled[0] + direction[r][1] * scaled[1] + direction[r][2] * scaled[2]
    })
}

// The direction is orthonormal, so its inverse is the transpose.
pub(crate) fn physical_to_index(
    spacing: &[f64; 3],
    origin: &[f64; 3],
    direction: &[[f64; 3]; 3],
    point: [f64; 3],
) -> [f64; 3] {
    let offset = [
        point[0] - origin[0],
        point[1] - origin[1],
        point[2] - origin[2],
    ];
    std::array::from_fn(|c| {
        (direction[0][c] * offset[0] + direction[1][c] * offset[1] + direction[2][c] * offset[2])
            / spacing[c]
    })
}

fn is_orthonormal(direction: &[[f64; 3]; 3]) -> bool {
    (0..3).all(|a| {
        (0..3).all(|b| {
            let dot: f64 = (0..3).map(|r| direction[r][a] * direction[r][b]).sum();
            let expected = if a == b { 1.0 } else { 0.0 };
            (dot - expected).abs() <= ORTHONORMAL_TOLERANCE
        })
    })
}

/// Flatten voxel data into the layout the interpolation kernels expect.
///
/// The kernels index a flat buffer with width varying fastest: voxel
/// `(x, y, z)` lives at `x + W * (y + H * z)`. `data` is indexed `[z, y, x]`,
/// so its logical row-major order already is that layout; the flat buffer is
/// the reverse of the `[x, y, z]` order used for sizes and spacing.
pub fn to_flat_buffer<T: Sample>(data: &Array3<T>) -> Vec<f32> {
    data.iter().map(|&v| v.to_f32()).collect()
}

/// A buffer of `len` copies of `value`, or `InvalidVolume` when it cannot be
/// allocated.
pub(crate) fn try_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>, ResampleError> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(len).map_err(|err| {
        ResampleError::InvalidVolume(format!("cannot allocate {len} voxels: {err}"))
    })?;
    buffer.resize(len, value);
    Ok(buffer)
}

/// Inverse of [`to_flat_buffer`] for a buffer of `size = [W, H, D]`.
///
/// The buffer is reshaped to `(D, H, W)` and cast back to `T` (lossy for
/// integer sample types, see [`Sample`]).
pub fn from_flat_buffer<T: Sample>(
    buffer: Vec<f32>,
    size: [usize; 3],
) -> Result<Array3<T>, ResampleError> {
    let [width, height, depth] = size;
    let actual = buffer.len();
    let expected = voxel_count(size).unwrap_or(usize::MAX);
    if actual != expected {
        return Err(ResampleError::ShapeMismatch { expected, actual });
    }
    let samples: Vec<T> = buffer.into_iter().map(T::from_f32).collect();
    Array3::from_shape_vec((depth, height, width), samples)
        .map_err(|_| ResampleError::ShapeMismatch { expected, actual })
}

/// A volume whose sample type is only known at runtime (e.g. read from disk).
#[derive(Debug, Clone, PartialEq)]
pub enum AnyVolume {
    U8(Volume<u8>),
    I8(Volume<i8>),
    U16(Volume<u16>),
    I16(Volume<i16>),
    U32(Volume<u32>),
    I32(Volume<i32>),
    F32(Volume<f32>),
    F64(Volume<f64>),
}

/// Evaluate `$body` with `$v` bound to the typed volume inside an [`AnyVolume`].
macro_rules! for_each_volume {
    ($any:expr, $v:ident => $body:expr) => {
        match $any {
            $crate::volume::AnyVolume::U8($v) => $body,
            $crate::volume::AnyVolume::I8($v) => $body,
            $crate::volume::AnyVolume::U16($v) => $body,
            $crate::volume::AnyVolume::I16($v) => $body,
            $crate::volume::AnyVolume::U32($v) => $body,
            $crate::volume::AnyVolume::I32($v) => $body,
            $crate::volume::AnyVolume::F32($v) => $body,
            $crate::volume::AnyVolume::F64($v) => $body,
        }
    };
}

/// Like [`for_each_volume`], for bodies returning `Result<Volume<T>, E>`;
/// the typed result is wrapped back into the same variant.
macro_rules! map_volume {
    ($any:expr, $v:ident => $body:expr) => {
        match $any {
            $crate::volume::AnyVolume::U8($v) => $body.map($crate::volume::AnyVolume::U8),
            $crate::volume::AnyVolume::I8($v) => $body.map($crate::volume::AnyVolume::I8),
            $crate::volume::AnyVolume::U16($v) => $body.map($crate::volume::AnyVolume::U16),
            $crate::volume::AnyVolume::I16($v) => $body.map($crate::volume::AnyVolume::I16),
            $crate::volume::AnyVolume::U32($v) => $body.map($crate::volume::AnyVolume::U32),
            $crate::volume::AnyVolume::I32($v) => $body.map($crate::volume::AnyVolume::I32),
            $crate::volume::AnyVolume::F32($v) => $body.map($crate::volume::AnyVolume::F32),
            $crate::volume::AnyVolume::F64($v) => $body.map($crate::volume::AnyVolume::F64),
        }
    };
}

pub(crate) use {for_each_volume, map_volume};

macro_rules! impl_from_volume {
    ($($variant:ident => $ty:ty),*) => {
        $(
            impl From<Volume<$ty>> for AnyVolume {
                fn from(volume: Volume<$ty>) -> Self {
                    AnyVolume::$variant(volume)
                }
            }
        )*
    };
}

impl_from_volume!(U8 => u8, I8 => i8, U16 => u16, I16 => i16, U32 => u32, I32 => i32, F32 => f32, F64 => f64);

impl AnyVolume {
    pub fn size(&self) -> [usize; 3] {
        for_each_volume!(self, v => v.size())
    }

    pub fn spacing(&self) -> [f64; 3] {
        for_each_volume!(self, v => v.spacing)
    }

    pub fn origin(&self) -> [f64; 3] {
        for_each_volume!(self, v => v.origin)
    }

    pub fn direction(&self) -> [[f64; 3]; 3] {
        for_each_volume!(self, v => v.direction)
    }

    pub fn sample_type(&self) -> &'static str {
        match self {
            AnyVolume::U8(_) => "u8",
            AnyVolume::I8(_) => "i8",
            AnyVolume::U16(_) => "u16",
            AnyVolume::I16(_) => "i16",
            AnyVolume::U32(_) => "u32",
            AnyVolume::I32(_) => "i32",
            AnyVolume::F32(_) => "f32",
            AnyVolume::F64(_) => "f64",
        }
    }
}
