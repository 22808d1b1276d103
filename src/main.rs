use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use volume_resample::{
    AcceleratorAvailability, AnyVolume, Processor, ResampleOptions, Resampler, SortBy,
    SpacingSpec, VolumeLoader,
    nifti_io::{read_nifti, write_nifti},
};

/// Resample a volume to the requested voxel spacing.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// NIfTI file or directory of .dcm files
    input: PathBuf,

    /// Output NIfTI file (.nii or .nii.gz)
    output: PathBuf,

    /// Resample on the CPU instead of the GPU
    #[arg(long)]
    cpu_resampling: bool,

    /// Skip the B-spline prefilter
    #[arg(long)]
    no_prefilter: bool,

    /// Target spacing in mm: one value (isotropic) or three (x y z)
    #[arg(required = true, num_args = 1.., allow_negative_numbers = true)]
    spacing: Vec<f64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let desired = SpacingSpec::from_values(&cli.spacing)?;
    let options = ResampleOptions {
        processor: if cli.cpu_resampling {
            Processor::CPU
        } else {
            Processor::GPU
        },
        prefilter: !cli.no_prefilter,
    };

    let accelerator = match options.processor {
        Processor::GPU => AcceleratorAvailability::probe().await,
        Processor::CPU => AcceleratorAvailability::Unavailable,
    };
    let resampler = Resampler::new(accelerator);

    let volume = load(&cli.input)?;
    info!(
        size = ?volume.size(),
        spacing = ?volume.spacing(),
        sample_type = volume.sample_type(),
        "Loaded input"
    );

    let resampled = volume.fix_spacing(&resampler, &desired, &options)?;
    write_nifti(&cli.output, &resampled)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;
    Ok(())
}

fn load(input: &Path) -> anyhow::Result<AnyVolume> {
    if input.is_dir() {
        let volume = VolumeLoader::load_from_directory(input, SortBy::ImagePositionPatient)
            .with_context(|| format!("failed to load DICOM series from {}", input.display()))?;
        Ok(volume.into())
    } else {
        read_nifti(input).with_context(|| format!("failed to read {}", input.display()))
    }
}
