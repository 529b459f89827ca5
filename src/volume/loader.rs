use super::{Affine, Volume};
use ndarray::{Axis, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum VolumeError {
	#[error("Failed to read volume {path}")]
	Read {
		path: PathBuf,
		#[source]
		source: nifti::NiftiError,
	},
	#[error("Expected a 3-D volume, got {ndim} dimensions")]
	Dimensionality { ndim: usize },
	#[error("Volume has no samples")]
	Empty,
}

pub(super) fn read_nifti(path: &Path) -> Result<Volume, VolumeError> {
	let read_error = |source| VolumeError::Read {
		path: path.to_path_buf(),
		source,
	};

	let object = ReaderOptions::new().read_file(path).map_err(read_error)?;
	let affine = affine_from_header(object.header());
	let samples = object
		.into_volume()
		.into_ndarray::<f32>()
		.map_err(read_error)?;

	let samples = match samples.ndim() {
		3 => samples,
		4 => {
			warn!(
				timepoints = samples.shape()[3],
				"Volume has a fourth dimension, using the first timepoint only"
			);
			samples.index_axis_move(Axis(3), 0)
		}
		ndim => return Err(VolumeError::Dimensionality { ndim }),
	};
	let samples = samples
		.into_dimensionality::<Ix3>()
		.map_err(|_| VolumeError::Dimensionality { ndim: 3 })?;

	if samples.is_empty() {
		return Err(VolumeError::Empty);
	}

	debug!(shape = ?samples.dim(), "Read NIfTI volume from {}", path.display());
	Ok(Volume::new(samples, affine))
}

/// Derives the voxel-to-patient transform the same way common neuroimaging tools do:
/// the sform when present, else the qform, else plain voxel scaling.
fn affine_from_header(header: &NiftiHeader) -> Affine {
	let pixdim = header.pixdim.map(f64::from);

	if header.sform_code > 0 {
		let row = |r: [f32; 4]| r.map(f64::from);
		return Affine::new([
			row(header.srow_x),
			row(header.srow_y),
			row(header.srow_z),
			[0.0, 0.0, 0.0, 1.0],
		]);
	}

	if header.qform_code > 0 {
		let (b, c, d) = (
			f64::from(header.quatern_b),
			f64::from(header.quatern_c),
			f64::from(header.quatern_d),
		);
		let a = (1.0 - b.mul_add(b, c.mul_add(c, d * d))).max(0.0).sqrt();
		let qfac = if pixdim[0] < 0.0 { -1.0 } else { 1.0 };
		let rotation = [
			[
				a * a + b * b - c * c - d * d,
				2.0 * (b * c - a * d),
				2.0 * (b * d + a * c),
			],
			[
				2.0 * (b * c + a * d),
				a * a + c * c - b * b - d * d,
				2.0 * (c * d - a * b),
			],
			[
				2.0 * (b * d - a * c),
				2.0 * (c * d + a * b),
				a * a + d * d - b * b - c * c,
			],
		];
		let scale = [pixdim[1], pixdim[2], pixdim[3] * qfac];
		let translation = [
			f64::from(header.quatern_x),
			f64::from(header.quatern_y),
			f64::from(header.quatern_z),
		];

		let mut rows = [[0.0; 4]; 4];
		for (r, row) in rows.iter_mut().take(3).enumerate() {
			for (col, value) in row.iter_mut().take(3).enumerate() {
				*value = rotation[r][col] * scale[col];
			}
			row[3] = translation[r];
		}
		rows[3][3] = 1.0;
		return Affine::new(rows);
	}

	Affine::from_scale(pixdim[1], pixdim[2], pixdim[3])
}
