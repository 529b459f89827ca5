//! Volumetric input: a 3-D array of scalar samples and the affine that places it in
//! patient space.

mod loader;

pub use loader::VolumeError;

#[cfg(test)]
pub(crate) use loader::tests::nifti_bytes;

use ndarray::{Array3, ArrayView3};
use std::path::Path;

/// A 4x4 affine transform (row-major) from voxel indices to patient-space millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine([[f64; 4]; 4]);

impl Affine {
	pub const fn new(rows: [[f64; 4]; 4]) -> Self {
		Self(rows)
	}

	/// A scaling affine without rotation or translation.
	pub const fn from_scale(x: f64, y: f64, z: f64) -> Self {
		Self([
			[x, 0.0, 0.0, 0.0],
			[0.0, y, 0.0, 0.0],
			[0.0, 0.0, z, 0.0],
			[0.0, 0.0, 0.0, 1.0],
		])
	}

	#[must_use]
	pub const fn with_translation(mut self, translation: [f64; 3]) -> Self {
		self.0[0][3] = translation[0];
		self.0[1][3] = translation[1];
		self.0[2][3] = translation[2];
		self
	}

	/// The spatial part of column `index` (0..=3).
	pub const fn column(&self, index: usize) -> [f64; 3] {
		[self.0[0][index], self.0[1][index], self.0[2][index]]
	}

	pub const fn rows(&self) -> &[[f64; 4]; 4] {
		&self.0
	}
}

/// A loaded volume with `shape = (X, Y, Z)`.
///
/// Immutable once constructed. Z is the slice axis.
#[derive(Debug, Clone)]
pub struct Volume {
	samples: Array3<f32>,
	affine: Affine,
}

impl Volume {
	pub const fn new(samples: Array3<f32>, affine: Affine) -> Self {
		Self { samples, affine }
	}

	/// Reads a NIfTI-1 volume (`.nii` or `.nii.gz`).
	pub fn open(path: impl AsRef<Path>) -> Result<Self, VolumeError> {
		loader::read_nifti(path.as_ref())
	}

	pub fn samples(&self) -> ArrayView3<'_, f32> {
		self.samples.view()
	}

	pub const fn affine(&self) -> &Affine {
		&self.affine
	}

	pub fn slice_count(&self) -> usize {
		self.samples.dim().2
	}
}
