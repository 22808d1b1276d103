use crate::{enums::SortBy, volume::Volume};

use dicom::{
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, Array4, Axis, s};
use rayon::prelude::*;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum VolumeLoaderError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("Inconsistent image dimensions")]
    InconsistentDimensions,

    #[error("Missing spacing information")]
    MissingSpacing,

    #[error("Invalid image orientation")]
    InvalidOrientation,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

struct Slice {
    order: Option<f64>,
    position: Option<[f64; 3]>,
    image: Array2<f32>,
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from DICOM objects
    ///
    /// Samples are decoded with the modality LUT (rescale slope/intercept)
    /// applied and without VOI windowing. Origin and direction are taken
    /// from the patient position/orientation of the stacked slices.
    ///
    /// # Arguments
    ///
    /// * `dicom_objects` - Slice of DICOM file objects
    /// * `sort_by` - Method to sort the slices
    ///
    /// # Errors
    ///
    /// Returns error if no valid images found or dimensions are inconsistent
    pub fn load_from_dicom_objects(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
        sort_by: SortBy,
    ) -> Result<Volume<f32>, VolumeLoaderError> {
        let orientation = Self::get_orientation(dicom_objects)?;
        let normal = cross(orientation[0], orientation[1]);

        let mut slices: Vec<_> = dicom_objects
            .par_iter()
            .filter_map(|dicom_object| Self::extract_slice(dicom_object, &sort_by, normal))
            .collect();

        if slices.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }

        Self::sort_slices(&mut slices, sort_by);
        Self::validate_dimensions(&slices)?;

        let (row_spacing, column_spacing) =
            Self::get_pixel_spacing(dicom_objects).ok_or(VolumeLoaderError::MissingSpacing)?;
        let (slice_direction, slice_spacing) = Self::get_slice_geometry(&slices, normal)
            .or_else(|| Self::get_slice_thickness(dicom_objects).map(|thickness| (normal, thickness)))
            .ok_or(VolumeLoaderError::MissingSpacing)?;

        let origin = slices[0].position.unwrap_or([0.0; 3]);
        let [row_direction, column_direction] = orientation;
        let direction = std::array::from_fn(|r| {
            [row_direction[r], column_direction[r], slice_direction[r]]
        });

        let volume_array = Self::build_volume_array(&slices);
        info!(
            size = ?[volume_array.dim().2, volume_array.dim().1, volume_array.dim().0],
            "Loaded DICOM series"
        );

        Ok(
            Volume::new(volume_array, [column_spacing, row_spacing, slice_spacing])
                .with_origin(origin)
                .with_direction(direction),
        )
    }

    /// Load a volume from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path> + Sync],
        sort_by: SortBy,
    ) -> Result<Volume<f32>, VolumeLoaderError> {
        let objects: Result<Vec<_>, _> = paths
            .par_iter()
            .map(|path| open_file(path.as_ref()))
            .collect();

        Self::load_from_dicom_objects(&objects?, sort_by)
    }

    /// Load a volume from a directory containing .dcm files
    pub fn load_from_directory(
        path: impl AsRef<Path>,
        sort_by: SortBy,
    ) -> Result<Volume<f32>, VolumeLoaderError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(VolumeLoaderError::NoValidImages);
        }
        debug!(files = paths.len(), "Reading DICOM directory");

        Self::load_from_file_paths(&paths, sort_by)
    }

    fn extract_slice(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: &SortBy,
        normal: [f64; 3],
    ) -> Option<Slice> {
        let position = Self::get_position(dicom_object);
        let order = Self::get_sort_order(dicom_object, sort_by, position, normal)?;
        let image = Self::decode_image(dicom_object)?;
        Some(Slice {
            order,
            position,
            image,
        })
    }

    fn get_sort_order(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        sort_by: &SortBy,
        position: Option<[f64; 3]>,
        normal: [f64; 3],
    ) -> Option<Option<f64>> {
        match sort_by {
            // Distance along the slice normal
            SortBy::ImagePositionPatient => Some(Some(dot(position?, normal))),
            SortBy::TablePosition => {
                let pos = dicom_object
                    .element(tags::TABLE_POSITION)
                    .ok()?
                    .to_float64()
                    .ok();
                Some(pos)
            }
            SortBy::InstanceNumber => {
                let num = dicom_object
                    .element(tags::INSTANCE_NUMBER)
                    .ok()?
                    .to_int::<i32>()
                    .ok()
                    .map(f64::from);
                Some(num)
            }
            SortBy::None => Some(Some(0.0)),
        }
    }

    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<[f64; 3]> {
        let pos = dicom_object
            .element(tags::IMAGE_POSITION_PATIENT)
            .ok()?
            .to_multi_float64()
            .ok()?;
        match pos[..] {
            [x, y, z] => Some([x, y, z]),
            _ => None,
        }
    }

    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        let frames = pixel_data.to_ndarray_with_options::<f32>(&options).ok()?;
        Some(Self::first_frame(frames))
    }

    /// First frame, first sample of a `[frame, row, column, sample]` array.
    fn first_frame(frames: Array4<f32>) -> Array2<f32> {
        let frame_count = frames.len_of(Axis(0));
        if frame_count > 1 {
            warn!(frames = frame_count, "Multi-frame object, only the first frame is used");
        }
        frames.slice_move(s![0, .., .., 0])
    }

    fn sort_slices(slices: &mut [Slice], sort_by: SortBy) {
        if !matches!(sort_by, SortBy::None) {
            slices.sort_by(|a, b| a.order.partial_cmp(&b.order).unwrap_or(std::cmp::Ordering::Equal));
        }
    }

    fn validate_dimensions(slices: &[Slice]) -> Result<(), VolumeLoaderError> {
        let first_dim = slices[0].image.dim();
        if slices.iter().any(|slice| slice.image.dim() != first_dim) {
            return Err(VolumeLoaderError::InconsistentDimensions);
        }
        Ok(())
    }

    fn build_volume_array(slices: &[Slice]) -> Array3<f32> {
        let (height, width) = slices[0].image.dim();
        let depth = slices.len();
        let mut volume = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            volume.slice_mut(s![i, .., ..]).assign(&slice.image);
        }

        volume
    }

    /// Row and column direction cosines; identity when the tag is absent.
    fn get_orientation(
        dicom_objects: &[FileDicomObject<InMemDicomObject>],
    ) -> Result<[[f64; 3]; 2], VolumeLoaderError> {
        let orientation = dicom_objects.iter().find_map(|dicom_object| {
            dicom_object
                .element(tags::IMAGE_ORIENTATION_PATIENT)
                .ok()?
                .to_multi_float64()
                .ok()
        });
        let Some(orientation) = orientation else {
            return Ok([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]);
        };
        let [rx, ry, rz, cx, cy, cz] = orientation[..] else {
            return Err(VolumeLoaderError::InvalidOrientation);
        };
        let row = normalize([rx, ry, rz]).ok_or(VolumeLoaderError::InvalidOrientation)?;
        let column = normalize([cx, cy, cz]).ok_or(VolumeLoaderError::InvalidOrientation)?;
        if dot(row, column).abs() > 1e-3 {
            return Err(VolumeLoaderError::InvalidOrientation);
        }
        Ok([row, column])
    }

    /// Direction and spacing of the slice stack, from the first and last
    /// slice positions.
    fn get_slice_geometry(slices: &[Slice], normal: [f64; 3]) -> Option<([f64; 3], f64)> {
        if slices.len() < 2 {
            return None;
        }
        let first = slices.first()?.position?;
        let last = slices.last()?.position?;
        let offset = [last[0] - first[0], last[1] - first[1], last[2] - first[2]];
        let distance = dot(offset, normal);
        if distance.abs() < f64::EPSILON {
            return None;
        }
        let direction = if distance < 0.0 { normal.map(|c| -c) } else { normal };
        Some((direction, distance.abs() / (slices.len() - 1) as f64))
    }

    fn get_pixel_spacing(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<(f64, f64)> {
        dicom_objects.iter().find_map(|dicom_object| {
            let pixel_spacing = dicom_object
                .element(tags::PIXEL_SPACING)
                .ok()?
                .to_multi_float64()
                .ok()?;
            match pixel_spacing[..] {
                [row, column] => Some((row, column)),
                _ => None,
            }
        })
    }

    fn get_slice_thickness(dicom_objects: &[FileDicomObject<InMemDicomObject>]) -> Option<f64> {
        dicom_objects.iter().find_map(|dicom_object| {
            dicom_object
                .element(tags::SLICE_THICKNESS)
                .ok()?
                .to_float64()
                .ok()
        })
    }
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalize(v: [f64; 3]) -> Option<[f64; 3]> {
    let norm = dot(v, v).sqrt();
    (norm > 1e-9).then(|| v.map(|c| c / norm))
}
