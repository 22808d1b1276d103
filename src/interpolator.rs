use ndarray::{Array3, ArrayView3, ArrayViewMut1, ArrayViewMut3, Axis, ShapeError, Zip};

use crate::enums::Processor;
use crate::planner::{achieved_spacing, voxel_count};
use crate::resampler::ResampleError;
use crate::volume::{Sample, Volume, index_to_physical, try_filled};

/// Pixel value written where the output grid leaves the input buffer.
pub const DEFAULT_PIXEL_VALUE: f64 = -2000.0;

// Cubic B-spline pole (sqrt(3) - 2) and the matching filter gain.
const POLE: f64 = -0.267_949_192_431_122_7;
const GAIN: f64 = 6.0;
const PREFILTER_TOLERANCE: f64 = 1e-6;

/// A backend that resamples a whole volume held in a flat buffer.
///
/// `input` and `output` are width-fastest buffers (see
/// [`crate::volume::to_flat_buffer`]) of `src = [W, H, D]` and
/// `dst = [W', H', D']` voxels. Both are allocated by the caller; the
/// interpolator only writes into `output`. Output voxel `(x, y, z)` samples the
/// input at the continuous index `(x * W / W', y * H / H', z * D / D')`.
pub trait Interpolator {
    fn processor(&self) -> Processor;

    fn interpolate(
        &self,
        input: &[f32],
        output: &mut [f32],
        src: [usize; 3],
        dst: [usize; 3],
        prefilter: bool,
    ) -> Result<(), ResampleError>;
}

pub(crate) fn check_buffers(
    input: &[f32],
    output: &[f32],
    src: [usize; 3],
    dst: [usize; 3],
) -> Result<(), ResampleError> {
    for (buffer, dims) in [(input, src), (output, dst)] {
        let expected = dims.iter().product::<usize>();
        if buffer.len() != expected {
            return Err(ResampleError::ShapeMismatch {
                expected,
                actual: buffer.len(),
            });
        }
    }
    Ok(())
}

/// Cubic B-spline resampling on the CPU.
#[derive(Debug, Clone)]
pub struct CpuInterpolator {
    default_value: f64,
}

impl Default for CpuInterpolator {
    fn default() -> Self {
        Self {
            default_value: DEFAULT_PIXEL_VALUE,
        }
    }
}

impl CpuInterpolator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for output voxels that map outside the input volume. It is cast
    /// into the sample type, so it saturates for unsigned volumes.
    pub fn with_default_value(mut self, default_value: f64) -> Self {
        self.default_value = default_value;
        self
    }

    pub fn default_value(&self) -> f64 {
        self.default_value
    }

    /// Resample `volume` onto a grid of `target_size = [W', H', D']` voxels
    /// spanning the same physical extent.
    ///
    /// Every output voxel is mapped to its physical position through the
    /// output geometry (achieved spacing, shared origin and direction) and
    /// back into a continuous input index.
    pub fn resample_volume<T: Sample>(
        &self,
        volume: &Volume<T>,
        target_size: [usize; 3],
        prefilter: bool,
    ) -> Result<Array3<T>, ResampleError> {
        let [width, height, depth] = target_size;
        let voxels = voxel_count(target_size).ok_or_else(|| {
            ResampleError::InvalidVolume(format!("target size {target_size:?} is too large"))
        })?;
        let output = try_filled(voxels, T::default())?;
        let mut output = Array3::from_shape_vec((depth, height, width), output).map_err(|_| {
            ResampleError::ShapeMismatch {
                expected: voxels,
                actual: voxels,
            }
        })?;

        let mut coefficients = volume.data.mapv(|v| v.to_f64());
        if prefilter {
            prefilter_volume(&mut coefficients);
        }
        let coefficients = coefficients.view();

        let size = volume.size();
        let out_spacing = achieved_spacing(volume.spacing, size, target_size);
        let default_value = T::from_f64(self.default_value);

        Zip::indexed(&mut output).par_for_each(|(z, y, x), value| {
            let point = index_to_physical(
                &out_spacing,
                &volume.origin,
                &volume.direction,
                [x as f64, y as f64, z as f64],
            );
            let index = volume.physical_to_index(point);
            *value = if is_inside(&index, size) {
                T::from_f64(evaluate(&coefficients, index))
            } else {
                default_value
            };
        });
        Ok(output)
    }
}

impl Interpolator for CpuInterpolator {
    fn processor(&self) -> Processor {
        Processor::CPU
    }

    fn interpolate(
        &self,
        input: &[f32],
        output: &mut [f32],
        src: [usize; 3],
        dst: [usize; 3],
        prefilter: bool,
    ) -> Result<(), ResampleError> {
        check_buffers(input, output, src, dst)?;
        let mismatch = |expected: usize, actual: usize| {
            move |_: ShapeError| ResampleError::ShapeMismatch { expected, actual }
        };

        let input = ArrayView3::from_shape((src[2], src[1], src[0]), input)
            .map_err(mismatch(src.iter().product(), input.len()))?;
        let mut coefficients = input.mapv(f64::from);
        if prefilter {
            prefilter_volume(&mut coefficients);
        }
        let coefficients = coefficients.view();

        let scale: [f64; 3] = std::array::from_fn(|axis| src[axis] as f64 / dst[axis] as f64);
        let output_len = output.len();
        let output = ArrayViewMut3::from_shape((dst[2], dst[1], dst[0]), output)
            .map_err(mismatch(dst.iter().product(), output_len))?;
        Zip::indexed(output).par_for_each(|(z, y, x), value| {
            let index = [
                x as f64 * scale[0],
                y as f64 * scale[1],
                z as f64 * scale[2],
            ];
            *value = evaluate(&coefficients, index) as f32;
        });
        Ok(())
    }
}

fn is_inside(index: &[f64; 3], size: [usize; 3]) -> bool {
    index
        .iter()
        .zip(size)
        .all(|(&i, n)| i >= -0.5 && i <= n as f64 - 0.5)
}

/// Convert samples to cubic B-spline coefficients, in place, along all axes.
pub(crate) fn prefilter_volume(coefficients: &mut Array3<f64>) {
    for axis in 0..3 {
        if coefficients.len_of(Axis(axis)) < 2 {
            continue;
        }
        Zip::from(coefficients.lanes_mut(Axis(axis))).par_for_each(|mut line| prefilter_line(&mut line));
    }
}

/// Recursive B-spline filter on one line with mirror-symmetric boundaries.
pub(crate) fn prefilter_line(line: &mut ArrayViewMut1<f64>) {
    let len = line.len();
    if len < 2 {
        return;
    }

    line.mapv_inplace(|v| v * GAIN);

    let first = initial_causal_coefficient(line);
    line[0] = first;
    for k in 1..len {
        line[k] += POLE * line[k - 1];
    }

    line[len - 1] = (POLE / (POLE * POLE - 1.0)) * (POLE * line[len - 2] + line[len - 1]);
    for k in (0..len - 1).rev() {
        line[k] = POLE * (line[k + 1] - line[k]);
    }
}

fn initial_causal_coefficient(line: &ArrayViewMut1<f64>) -> f64 {
    let len = line.len();
    let horizon = (PREFILTER_TOLERANCE.ln() / POLE.abs().ln()).ceil() as usize;

    if horizon < len {
        let mut zn = POLE;
        let mut sum = line[0];
        for k in 1..horizon {
            sum += zn * line[k];
            zn *= POLE;
        }
        return sum;
    }

    // Exact mirror-boundary initialisation for short lines.
    let mut zn = POLE;
    let inverse = 1.0 / POLE;
    let mut z2n = POLE.powi(len as i32 - 1);
    let mut sum = line[0] + z2n * line[len - 1];
    z2n *= z2n * inverse;
    for k in 1..len - 1 {
        sum += (zn + z2n) * line[k];
        zn *= POLE;
        z2n *= inverse;
    }
    sum / (1.0 - zn * zn)
}

/// Cubic B-spline weights for the four taps around a fractional offset.
#[inline]
pub(crate) fn bspline_weights(t: f64) -> [f64; 4] {
    let one_minus_t = 1.0 - t;
    let t2 = t * t;
    let t3 = t2 * t;
    [
        one_minus_t * one_minus_t * one_minus_t / 6.0,
        (4.0 - 6.0 * t2 + 3.0 * t3) / 6.0,
        (1.0 + 3.0 * t + 3.0 * t2 - 3.0 * t3) / 6.0,
        t3 / 6.0,
    ]
}

/// Reflect an out-of-range index back into `0..len` (whole-sample symmetry).
#[inline]
pub(crate) fn mirror(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let mut m = index.rem_euclid(period);
    if m >= len as isize {
        m = period - m;
    }
    m as usize
}

/// Evaluate the B-spline with `coefficients[[z, y, x]]` at `index = [x, y, z]`.
pub(crate) fn evaluate(coefficients: &ArrayView3<f64>, index: [f64; 3]) -> f64 {
    let (depth, height, width) = coefficients.dim();
    let lens = [width, height, depth];

    let mut taps = [[0usize; 4]; 3];
    let mut weights = [[0.0f64; 4]; 3];
    for axis in 0..3 {
        let base = index[axis].floor();
        weights[axis] = bspline_weights(index[axis] - base);
        let first = base as isize - 1;
        for k in 0..4 {
            taps[axis][k] = mirror(first + k as isize, lens[axis]);
        }
    }

    let mut value = 0.0;
    for (k, &z) in taps[2].iter().enumerate() {
        let mut plane = 0.0;
        for (j, &y) in taps[1].iter().enumerate() {
            let mut row = 0.0;
            for (i, &x) in taps[0].iter().enumerate() {
                row = coefficients[[z, y, x]].mul_add(weights[0][i], row);
            }
            plane = row.mul_add(weights[1][j], plane);
        }
        value = plane.mul_add(weights[2][k], value);
    }
    value
}
