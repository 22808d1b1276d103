//! # Volume-resample library
//!
//! This crate resamples 3D medical volumes to a requested voxel spacing.
//! Volumes are loaded from a directory of DICOM files or from a NIfTI file,
//! carry their geometry (spacing, origin and direction) and are written back
//! as NIfTI.
//!
//! The target grid is derived from the requested spacing by rounding
//! `size * spacing / desired` per axis. The spacing stored on the result is
//! the one achieved on that grid, which can differ slightly from the request.
//! When the rounded grid equals the current one the volume is returned
//! unchanged.
//!
//! Interpolation uses cubic B-splines, optionally after converting the
//! samples to B-spline coefficients (prefiltering). Two backends exist:
//!  - GPU: a WGPU compute shader, used when a hardware adapter is found
//!  - CPU: a rayon-parallel implementation that samples in physical space
//!
//! Asking for the GPU backend on a machine without an accelerator is an
//! error; the library never falls back to the CPU on its own.
//!
//! # Examples
//!
//! ## Resampling a NIfTI file to 1 mm isotropic voxels
//!
//! ```no_run
//! # use volume_resample::{AcceleratorAvailability, ResampleOptions, Resampler, SpacingSpec};
//! # use volume_resample::nifti_io::{read_nifti, write_nifti};
//! # async fn run() -> anyhow::Result<()> {
//! let resampler = Resampler::new(AcceleratorAvailability::probe().await);
//! let volume = read_nifti("ct.nii.gz")?;
//! let resampled = volume.fix_spacing(
//!     &resampler,
//!     &SpacingSpec::Isotropic(1.0),
//!     &ResampleOptions::default(),
//! )?;
//! write_nifti("ct_1mm.nii.gz", &resampled)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Resampling a typed volume on the CPU
//!
//! ```
//! # use ndarray::Array3;
//! # use volume_resample::{AcceleratorAvailability, Processor, ResampleOptions, Resampler, SpacingSpec, Volume};
//! let volume = Volume::new(Array3::<i16>::zeros((10, 10, 10)), [1.0; 3]);
//! let resampler = Resampler::new(AcceleratorAvailability::Unavailable);
//! let options = ResampleOptions {
//!     processor: Processor::CPU,
//!     prefilter: true,
//! };
//! let resampled = resampler
//!     .fix_spacing(volume, &SpacingSpec::Isotropic(2.0), &options)
//!     .unwrap();
//! assert_eq!(resampled.size(), [5, 5, 5]);
//! ```

pub mod enums;
pub mod gpu_interpolator;
pub mod interpolator;
pub mod nifti_io;
pub mod planner;
pub mod resampler;
pub mod volume;
pub mod volume_loader;

pub use enums::{Processor, SortBy};
pub use gpu_interpolator::{AcceleratorAvailability, GpuInterpolator};
pub use interpolator::{CpuInterpolator, DEFAULT_PIXEL_VALUE, Interpolator};
pub use planner::{ResamplePlan, SpacingSpec, achieved_spacing, plan};
pub use resampler::{ResampleError, ResampleOptions, Resampler};
pub use volume::{AnyVolume, Sample, Volume};
pub use volume_loader::{VolumeLoader, VolumeLoaderError};
