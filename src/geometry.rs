//! Derives DICOM spatial attributes from a volume affine.
//!
//! DICOM describes a pixel grid by the direction of a row (the direction in which the column
//! index grows) followed by the direction of a column. Slices are laid out with rows along the
//! affine's first axis and columns along its second, so the row direction cosine comes from
//! basis vector 1 and the column direction cosine from basis vector 0. Frames turned by a
//! [`Rotation`] get their row and column vectors and their top-left corner turned alike.

use crate::transcode::Rotation;
use crate::volume::Affine;
use thiserror::Error;

/// Fractional digits kept for direction cosines.
const ORIENTATION_DECIMALS: i32 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
	#[error("Affine basis vector {axis} has zero length")]
	DegenerateAxis { axis: usize },
	#[error("Affine contains non-finite values")]
	NonFinite,
}

/// Spatial attributes of a single slice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceGeometry {
	/// Pixel Spacing (0028,0030): row spacing, column spacing.
	pub pixel_spacing: [f64; 2],
	/// Slice Thickness (0018,0050).
	pub slice_thickness: f64,
	/// Image Position (Patient) (0020,0032) of the first transmitted pixel.
	pub position: [f64; 3],
}

/// Geometry of a whole volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
	/// Image Orientation (Patient) (0020,0037), shared by every slice.
	pub orientation: [f64; 6],
	pub slices: Vec<SliceGeometry>,
}

impl Geometry {
	pub fn pixel_spacing(&self) -> Option<[f64; 2]> {
		self.slices.first().map(|slice| slice.pixel_spacing)
	}

	pub fn slice_thickness(&self) -> Option<f64> {
		self.slices.first().map(|slice| slice.slice_thickness)
	}
}

/// Resolves orientation, spacing and per-slice positions for `slice_count` unrotated slices.
pub fn resolve(affine: &Affine, slice_count: usize) -> Result<Geometry, GeometryError> {
	resolve_rotated(affine, (1, 1, slice_count), Rotation::None)
}

/// Resolves the geometry of frames cut from a volume of `shape` voxels and turned by
/// `rotation`, so that every position names the voxel shown in the first pixel of its frame.
pub fn resolve_rotated(
	affine: &Affine,
	shape: (usize, usize, usize),
	rotation: Rotation,
) -> Result<Geometry, GeometryError> {
	if affine.rows().iter().flatten().any(|v| !v.is_finite()) {
		return Err(GeometryError::NonFinite);
	}

	let basis = [affine.column(0), affine.column(1), affine.column(2)];
	for (axis, vector) in basis.iter().enumerate() {
		if norm(vector) <= f64::EPSILON {
			return Err(GeometryError::DegenerateAxis { axis });
		}
	}

	#[allow(clippy::cast_precision_loss)]
	let (last_x, last_y) = (
		shape.0.saturating_sub(1) as f64,
		shape.1.saturating_sub(1) as f64,
	);
	let negate = |v: [f64; 3]| v.map(|c| -c);
	// Frame vectors along growing column and growing row index, and the voxel at pixel (0, 0)
	let (row, column, corner) = match rotation {
		Rotation::None => (basis[1], basis[0], [0.0, 0.0]),
		Rotation::Cw90 => (negate(basis[0]), basis[1], [last_x, 0.0]),
		Rotation::Rot180 => (negate(basis[1]), negate(basis[0]), [last_x, last_y]),
		Rotation::Ccw90 => (basis[0], negate(basis[1]), [0.0, last_y]),
	};
	let (row_length, column_length) = (norm(&row), norm(&column));
	let row_cosine = row.map(|v| round(v / row_length));
	let column_cosine = column.map(|v| round(v / column_length));
	let orientation = [
		row_cosine[0],
		row_cosine[1],
		row_cosine[2],
		column_cosine[0],
		column_cosine[1],
		column_cosine[2],
	];

	let translation = affine.column(3);
	let origin: [f64; 3] = std::array::from_fn(|axis| {
		basis[1][axis].mul_add(corner[1], basis[0][axis].mul_add(corner[0], translation[axis]))
	});
	let step = basis[2];
	let thickness = norm(&step);
	let slices = (0..shape.2)
		.map(|index| {
			#[allow(clippy::cast_precision_loss)]
			let index = index as f64;
			SliceGeometry {
				pixel_spacing: [row_length, column_length],
				slice_thickness: thickness,
				position: std::array::from_fn(|axis| step[axis].mul_add(index, origin[axis])),
			}
		})
		.collect();

	Ok(Geometry {
		orientation,
		slices,
	})
}

fn norm(vector: &[f64; 3]) -> f64 {
	vector.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn round(value: f64) -> f64 {
	let factor = 10_f64.powi(ORIENTATION_DECIMALS);
	let rounded = (value * factor).round() / factor;
	// Normalise -0.0
	if rounded == 0.0 {
		0.0
	} else {
		rounded
	}
}
