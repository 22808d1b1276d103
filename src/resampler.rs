use thiserror::Error;
use tracing::{debug, error, info};
use web_time::Instant;

use crate::enums::Processor;
use crate::gpu_interpolator::AcceleratorAvailability;
use crate::interpolator::CpuInterpolator;
use crate::planner::{SpacingSpec, achieved_spacing, plan, voxel_count};
use crate::volume::{AnyVolume, Sample, Volume, from_flat_buffer, map_volume, try_filled};

#[derive(Debug, Error)]
pub enum ResampleError {
    #[error("Invalid spacing: {0}")]
    InvalidSpacing(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("{processor} resampling is unavailable: {reason}")]
    BackendUnavailable { processor: Processor, reason: String },

    #[error("Interpolator returned {actual} voxels, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Device limit exceeded for {what}: {required} > {limit}")]
    DeviceLimit {
        what: &'static str,
        required: u64,
        limit: u64,
    },

    #[error("GPU error: {0}")]
    Device(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResampleOptions {
    pub processor: Processor,
    /// Convert samples to B-spline coefficients before interpolating.
    pub prefilter: bool,
}

impl Default for ResampleOptions {
    fn default() -> Self {
        Self {
            processor: Processor::GPU,
            prefilter: true,
        }
    }
}

/// Resamples volumes to a new voxel grid on the GPU or the CPU.
///
/// GPU availability is decided once, when the resampler is built. Asking for
/// [`Processor::GPU`] without an accelerator fails with
/// [`ResampleError::BackendUnavailable`]; the resampler never switches to
/// the CPU on its own.
#[derive(Debug)]
pub struct Resampler {
    accelerator: AcceleratorAvailability,
    cpu: CpuInterpolator,
}

impl Resampler {
    pub fn new(accelerator: AcceleratorAvailability) -> Self {
        Self {
            accelerator,
            cpu: CpuInterpolator::default(),
        }
    }

    pub fn with_cpu_interpolator(mut self, cpu: CpuInterpolator) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn accelerator(&self) -> &AcceleratorAvailability {
        &self.accelerator
    }

    /// Resample `volume` to the spacing closest to `desired`.
    ///
    /// When the rounded target grid equals the current one the input volume
    /// is returned as is, without going through an interpolator.
    pub fn fix_spacing<T: Sample>(
        &self,
        volume: Volume<T>,
        desired: &SpacingSpec,
        options: &ResampleOptions,
    ) -> Result<Volume<T>, ResampleError> {
        volume.validate()?;
        let plan = plan(volume.size(), volume.spacing, desired)?;
        if plan.is_noop {
            info!(size = ?volume.size(), "Nothing to do, volume already has the closest spacing");
            return Ok(volume);
        }
        self.resample(&volume, plan.target_size, options.processor, options.prefilter)
    }

    /// Resample `volume` to `target_size = [W', H', D']` voxels.
    ///
    /// The output keeps origin and direction of the input; its spacing is the
    /// spacing achieved on the new grid, not the one that was requested.
    pub fn resample<T: Sample>(
        &self,
        volume: &Volume<T>,
        target_size: [usize; 3],
        processor: Processor,
        prefilter: bool,
    ) -> Result<Volume<T>, ResampleError> {
        volume.validate()?;
        if target_size.contains(&0) {
            return Err(ResampleError::InvalidVolume(format!(
                "target size {target_size:?} has an empty axis"
            )));
        }
        let voxels = voxel_count(target_size).ok_or_else(|| {
            ResampleError::InvalidVolume(format!("target size {target_size:?} is too large"))
        })?;

        let size = volume.size();
        let spacing = achieved_spacing(volume.spacing, size, target_size);
        info!(%processor, ?size, ?target_size, ?spacing, prefilter, "Resampling");
        let start = Instant::now();

        let data = match processor {
            Processor::GPU => {
                let interpolator = self.accelerator.interpolator().ok_or_else(|| {
                    ResampleError::BackendUnavailable {
                        processor,
                        reason: "no accelerator was found".to_string(),
                    }
                })?;
                let input = volume.to_flat_buffer();
                let mut output = try_filled(voxels, 0.0f32)?;
                interpolator
                    .interpolate(&input, &mut output, size, target_size, prefilter)
                    .inspect_err(|err| error!(%err, "GPU resampling failed"))?;
                drop(input);
                from_flat_buffer(output, target_size)?
            }
            Processor::CPU => self.cpu.resample_volume(volume, target_size, prefilter)?,
        };
        debug!(elapsed = ?start.elapsed(), "Resampling finished");

        Ok(Volume {
            data,
            spacing,
            origin: volume.origin,
            direction: volume.direction,
        })
    }
}

impl AnyVolume {
    /// [`Resampler::fix_spacing`] for a volume of any sample type.
    pub fn fix_spacing(
        self,
        resampler: &Resampler,
        desired: &SpacingSpec,
        options: &ResampleOptions,
    ) -> Result<AnyVolume, ResampleError> {
        map_volume!(self, volume => resampler.fix_spacing(volume, desired, options))
    }
}
