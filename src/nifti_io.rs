use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, NiftiType, NiftiVolume, ReaderOptions};
use thiserror::Error;
use tracing::{debug, info};

use crate::volume::{AnyVolume, Sample, Volume, for_each_volume};

// NIfTI stores geometry in RAS, volumes carry it in LPS: x and y flip sign.
const RAS_TO_LPS: [f64; 3] = [-1.0, -1.0, 1.0];

const NIFTI_UNITS_MM: u8 = 2;
const NIFTI_XFORM_SCANNER_ANAT: i16 = 1;

#[derive(Debug, Error)]
pub enum NiftiIoError {
    #[error("NIfTI error: {0}")]
    Nifti(#[from] nifti::NiftiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported NIfTI data type {0}")]
    UnsupportedType(String),

    #[error("Expected a 3D volume, found shape {0:?}")]
    UnsupportedShape(Vec<usize>),

    #[error("Degenerate voxel axis {0} in the NIfTI transform")]
    DegenerateAxis(usize),

    #[error("Invalid output path {0}")]
    InvalidPath(PathBuf),
}

type Geometry = ([f64; 3], [f64; 3], [[f64; 3]; 3]);

/// Read a NIfTI-1 file, keeping its sample type.
///
/// Geometry comes from the sform when present, then the qform, then the
/// plain voxel sizes.
pub fn read_nifti(path: impl AsRef<Path>) -> Result<AnyVolume, NiftiIoError> {
    let path = path.as_ref();
    let object = ReaderOptions::new().read_file(path)?;
    let geometry = geometry_from_affine(&affine_from_header(object.header()))?;
    let volume = object.into_volume();

    macro_rules! typed {
        ($ty:ty) => {
            build_volume::<$ty>(volume.into_ndarray::<$ty>()?, geometry)?.into()
        };
    }

    let data_type = volume.data_type();
    let volume: AnyVolume = match data_type {
        NiftiType::Uint8 => typed!(u8),
        NiftiType::Int8 => typed!(i8),
        NiftiType::Uint16 => typed!(u16),
        NiftiType::Int16 => typed!(i16),
        NiftiType::Uint32 => typed!(u32),
        NiftiType::Int32 => typed!(i32),
        NiftiType::Float32 => typed!(f32),
        NiftiType::Float64 => typed!(f64),
        other => return Err(NiftiIoError::UnsupportedType(format!("{other:?}"))),
    };
    info!(
        path = %path.display(),
        size = ?volume.size(),
        spacing = ?volume.spacing(),
        sample_type = volume.sample_type(),
        "Read NIfTI volume"
    );
    Ok(volume)
}

/// Write `volume` to `path` as NIfTI-1 (gzip-compressed for `.nii.gz`).
///
/// The file is written next to `path` under a temporary name and renamed
/// once complete, so a failed write never leaves a file at `path`.
pub fn write_nifti(path: impl AsRef<Path>, volume: &AnyVolume) -> Result<(), NiftiIoError> {
    let path = path.as_ref();
    let partial = partial_path(path)?;
    debug!(partial = %partial.display(), "Writing NIfTI volume");

    let result = write_volume(&partial, volume).and_then(|()| Ok(fs::rename(&partial, path)?));
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result?;

    info!(path = %path.display(), size = ?volume.size(), "Wrote NIfTI volume");
    Ok(())
}

fn partial_path(path: &Path) -> Result<PathBuf, NiftiIoError> {
    let name = path
        .file_name()
        .ok_or_else(|| NiftiIoError::InvalidPath(path.to_path_buf()))?;
    // keep the extension, the writer picks compression from it
    Ok(path.with_file_name(format!(".partial-{}", name.to_string_lossy())))
}

fn write_volume(path: &Path, volume: &AnyVolume) -> Result<(), NiftiIoError> {
    let header = header_for(volume.spacing(), volume.origin(), volume.direction());
    let writer = WriterOptions::new(path).reference_header(&header);
    // NIfTI arrays are indexed (x, y, z)
    for_each_volume!(volume, v => writer.write_nifti(&v.data.view().reversed_axes()))?;
    Ok(())
}

fn build_volume<T: Sample>(array: ArrayD<T>, geometry: Geometry) -> Result<Volume<T>, NiftiIoError> {
    let array = match array.shape() {
        [_, _, _] => array,
        [_, _, _, 1] => array.index_axis_move(Axis(3), 0),
        shape => return Err(NiftiIoError::UnsupportedShape(shape.to_vec())),
    };
    let shape = array.shape().to_vec();
    let array = array
        .into_dimensionality::<Ix3>()
        .map_err(|_| NiftiIoError::UnsupportedShape(shape))?;
    let data = array.reversed_axes().as_standard_layout().into_owned();

    let (spacing, origin, direction) = geometry;
    Ok(Volume::new(data, spacing)
        .with_origin(origin)
        .with_direction(direction))
}

/// The voxel-to-RAS transform as three `[m0, m1, m2, t]` rows.
fn affine_from_header(header: &NiftiHeader) -> [[f64; 4]; 3] {
    let widen = |row: [f32; 4]| row.map(f64::from);
    if header.sform_code > 0 {
        return [widen(header.srow_x), widen(header.srow_y), widen(header.srow_z)];
    }

    let pixdim = header.pixdim.map(f64::from);
    if header.qform_code > 0 {
        let b = f64::from(header.quatern_b);
        let c = f64::from(header.quatern_c);
        let d = f64::from(header.quatern_d);
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
        let qfac = if pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let (dx, dy, dz) = (pixdim[1], pixdim[2], pixdim[3] * qfac);
        let (qx, qy, qz) = (
            f64::from(header.quatern_x),
            f64::from(header.quatern_y),
            f64::from(header.quatern_z),
        );
        return [
            [
                (a * a + b * b - c * c - d * d) * dx,
                (2.0 * b * c - 2.0 * a * d) * dy,
                (2.0 * b * d + 2.0 * a * c) * dz,
                qx,
            ],
            [
                (2.0 * b * c + 2.0 * a * d) * dx,
                (a * a + c * c - b * b - d * d) * dy,
                (2.0 * c * d - 2.0 * a * b) * dz,
                qy,
            ],
            [
                (2.0 * b * d - 2.0 * a * c) * dx,
                (2.0 * c * d + 2.0 * a * b) * dy,
                (a * a + d * d - c * c - b * b) * dz,
                qz,
            ],
        ];
    }

    [
        [pixdim[1], 0.0, 0.0, 0.0],
        [0.0, pixdim[2], 0.0, 0.0],
        [0.0, 0.0, pixdim[3], 0.0],
    ]
}

fn geometry_from_affine(affine: &[[f64; 4]; 3]) -> Result<Geometry, NiftiIoError> {
    let mut spacing = [0.0; 3];
    let mut direction = [[0.0; 3]; 3];
    for c in 0..3 {
        let norm = (0..3).map(|r| affine[r][c] * affine[r][c]).sum::<f64>().sqrt();
        if norm <= 1e-12 {
            return Err(NiftiIoError::DegenerateAxis(c));
        }
        spacing[c] = norm;
        for r in 0..3 {
            direction[r][c] = RAS_TO_LPS[r] * affine[r][c] / norm;
        }
    }
    let origin = std::array::from_fn(|r| RAS_TO_LPS[r] * affine[r][3]);
    Ok((spacing, origin, direction))
}

fn header_for(spacing: [f64; 3], origin: [f64; 3], direction: [[f64; 3]; 3]) -> NiftiHeader {
    let row = |r: usize| -> [f32; 4] {
        let sign = RAS_TO_LPS[r];
        [
            (sign * direction[r][0] * spacing[0]) as f32,
            (sign * direction[r][1] * spacing[1]) as f32,
            (sign * direction[r][2] * spacing[2]) as f32,
            (sign * origin[r]) as f32,
        ]
    };

    let mut header = NiftiHeader::default();
    header.pixdim = [
        1.0,
        spacing[0] as f32,
        spacing[1] as f32,
        spacing[2] as f32,
        1.0,
        1.0,
        1.0,
        1.0,
    ];
    header.xyzt_units = NIFTI_UNITS_MM;
    header.qform_code = 0;
    header.sform_code = NIFTI_XFORM_SCANNER_ANAT;
    header.srow_x = row(0);
    header.srow_y = row(1);
    header.srow_z = row(2);
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn assert_close(actual: &[f64], expected: &[f64]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{actual:?} vs {expected:?}");
        }
    }

    fn oblique_volume() -> Volume<i16> {
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (x + 10 * y + 100 * z) as i16 - 200);
        Volume::new(data, [0.5, 0.75, 2.0])
            .with_origin([-12.5, 30.0, 4.25])
            .with_direction([[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]])
    }

    #[test]
    fn write_then_read_keeps_data_and_geometry() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["volume.nii", "volume.nii.gz"] {
            let path = dir.path().join(name);
            let volume = oblique_volume();
            write_nifti(&path, &AnyVolume::from(volume.clone())).unwrap();

            let AnyVolume::I16(read) = read_nifti(&path).unwrap() else {
                panic!("sample type changed");
            };
            assert_eq!(read.data, volume.data);
            assert_close(&read.spacing, &volume.spacing);
            assert_close(&read.origin, &volume.origin);
            for r in 0..3 {
                assert_close(&read.direction[r], &volume.direction[r]);
            }
        }
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".partial-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.nii");
        let volume = AnyVolume::from(oblique_volume());
        assert!(write_nifti(&path, &volume).is_err());
        assert!(!path.exists());
        assert!(!dir.path().join("missing").join(".partial-out.nii").exists());
    }

    #[test]
    fn header_round_trips_lps_geometry() {
        let volume = oblique_volume();
        let header = header_for(volume.spacing, volume.origin, volume.direction);
        // RAS: x and y flip sign
        assert_eq!(header.srow_x[3], 12.5);
        assert_eq!(header.srow_y[3], -30.0);
        let (spacing, origin, direction) = geometry_from_affine(&affine_from_header(&header)).unwrap();
        assert_close(&spacing, &volume.spacing);
        assert_close(&origin, &volume.origin);
        for r in 0..3 {
            assert_close(&direction[r], &volume.direction[r]);
        }
    }

    #[test]
    fn identity_qform_is_used_without_sform() {
        let mut header = NiftiHeader::default();
        header.sform_code = 0;
        header.qform_code = 1;
        header.quatern_b = 0.0;
        header.quatern_c = 0.0;
        header.quatern_d = 0.0;
        header.quatern_x = 5.0;
        header.quatern_y = 6.0;
        header.quatern_z = 7.0;
        header.pixdim = [1.0, 2.0, 3.0, 4.0, 0.0, 0.0, 0.0, 0.0];
        let (spacing, origin, direction) = geometry_from_affine(&affine_from_header(&header)).unwrap();
        assert_eq!(spacing, [2.0, 3.0, 4.0]);
        assert_eq!(origin, [-5.0, -6.0, 7.0]);
        assert_eq!(direction, [[-1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0]]);
    }

    #[test]
    fn degenerate_transform_is_rejected() {
        let affine = [[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]];
        assert!(matches!(
            geometry_from_affine(&affine),
            Err(NiftiIoError::DegenerateAxis(1))
        ));
    }

    #[test]
    fn four_dimensional_single_frame_is_accepted() {
        let array = ArrayD::<f32>::zeros(vec![5, 4, 3, 1]);
        let volume = build_volume(array, ([1.0; 3], [0.0; 3], crate::volume::IDENTITY_DIRECTION)).unwrap();
        assert_eq!(volume.size(), [5, 4, 3]);

        let array = ArrayD::<f32>::zeros(vec![5, 4, 3, 2]);
        assert!(matches!(
            build_volume(array, ([1.0; 3], [0.0; 3], crate::volume::IDENTITY_DIRECTION)),
            Err(NiftiIoError::UnsupportedShape(_))
        ));
    }
}
