//! Maps floating point voxel samples onto integer DICOM pixel data.

use ndarray::{ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscodeError {
	#[error("Volume has no samples")]
	Empty,
	#[error("Volume contains {count} non-finite samples")]
	NonFinite { count: usize },
	#[error("Unsupported bit depth {bits}, expected 8 to 16")]
	UnsupportedBitDepth { bits: u16 },
}

/// In-plane rotation applied to each slice before it becomes a frame.
///
/// Slices are taken from the volume as `[x, y]` arrays. Without rotation, `x` runs down the
/// rows and `y` along the columns, matching the orientation reported by the geometry resolver.
/// Rotations turn the slice in quarter steps, clockwise for [`Rotation::Cw90`]. The geometry
/// resolver composes the same turn into orientation and position, see
/// [`crate::geometry::resolve_rotated`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
	#[default]
	None,
	Cw90,
	Rot180,
	Ccw90,
}

impl Rotation {
	pub fn apply<'a>(self, slice: ArrayView2<'a, f32>) -> ArrayView2<'a, f32> {
		let mut view = match self {
			Self::None | Self::Rot180 => slice,
			Self::Cw90 | Self::Ccw90 => slice.reversed_axes(),
		};
		match self {
			Self::None => {}
			Self::Cw90 => view.invert_axis(Axis(1)),
			Self::Rot180 => {
				view.invert_axis(Axis(0));
				view.invert_axis(Axis(1));
			}
			Self::Ccw90 => view.invert_axis(Axis(0)),
		}
		view
	}
}

impl FromStr for Rotation {
	type Err = ParseRotationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"none" | "0" => Ok(Self::None),
			"cw90" | "90" => Ok(Self::Cw90),
			"rot180" | "180" => Ok(Self::Rot180),
			"ccw90" | "270" => Ok(Self::Ccw90),
			_ => Err(ParseRotationError(s.to_owned())),
		}
	}
}

#[derive(Debug, Error)]
#[error("Unknown rotation {0}, expected none, cw90, rot180 or ccw90")]
pub struct ParseRotationError(String);

/// VOI window in real-world units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
	pub center: f64,
	pub width: f64,
}

/// Pixel Representation (0028,0103).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelRepresentation {
	Unsigned = 0,
	Signed = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Samples {
	Signed16(Vec<i16>),
	Unsigned8(Vec<u8>),
}

/// Encoded pixel data of one or more frames plus the attributes needed to display it.
///
/// Frames are stored contiguously in ascending slice order, each frame row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
	pub rows: usize,
	pub columns: usize,
	pub frames: usize,
	pub samples: Samples,
	pub rescale_slope: f64,
	/// The real value mapped onto [`PixelBuffer::stored_min`].
	pub rescale_intercept: f64,
	/// Smallest representable stored value.
	pub stored_min: i32,
	pub window: Window,
	pub bits_allocated: u16,
	pub bits_stored: u16,
	pub high_bit: u16,
	pub pixel_representation: PixelRepresentation,
}

impl PixelBuffer {
	pub const fn frame_len(&self) -> usize {
		self.rows * self.columns
	}

	/// Rescale Intercept (0028,1052) as written to the dataset, so that
	/// `stored * slope + intercept` yields the real value.
	pub fn modality_intercept(&self) -> f64 {
		f64::from(self.stored_min).mul_add(-self.rescale_slope, self.rescale_intercept)
	}

	/// Little endian bytes of a single frame.
	pub fn frame_bytes(&self, frame: usize) -> Vec<u8> {
		let range = frame * self.frame_len()..(frame + 1) * self.frame_len();
		match &self.samples {
			Samples::Signed16(values) => values[range]
				.iter()
				.flat_map(|v| v.to_le_bytes())
				.collect(),
			Samples::Unsigned8(values) => values[range].to_vec(),
		}
	}

	/// Little endian bytes of all frames.
	pub fn to_bytes(&self) -> Vec<u8> {
		match &self.samples {
			Samples::Signed16(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
			Samples::Unsigned8(values) => values.clone(),
		}
	}

	/// Unsigned 8-bit samples, if this is a mask buffer.
	pub fn mask(&self) -> Option<&[u8]> {
		match &self.samples {
			Samples::Unsigned8(values) => Some(values),
			Samples::Signed16(_) => None,
		}
	}
}

fn check_finite(samples: &ArrayView3<'_, f32>) -> Result<(), TranscodeError> {
	if samples.is_empty() {
		return Err(TranscodeError::Empty);
	}
	let count = samples.iter().filter(|v| !v.is_finite()).count();
	if count > 0 {
		return Err(TranscodeError::NonFinite { count });
	}
	Ok(())
}

/// Collects every slice along the third axis, rotated, into one buffer.
fn frames<T>(
	samples: &ArrayView3<'_, f32>,
	rotation: Rotation,
	mut map: impl FnMut(f32) -> T,
) -> (usize, usize, Vec<T>) {
	let (x, y, z) = samples.dim();
	let (rows, columns) = match rotation {
		Rotation::None | Rotation::Rot180 => (x, y),
		Rotation::Cw90 | Rotation::Ccw90 => (y, x),
	};

	let mut values = Vec::with_capacity(x * y * z);
	for slice in samples.axis_iter(Axis(2)) {
		values.extend(rotation.apply(slice).iter().map(|&v| map(v)));
	}
	(rows, columns, values)
}

/// Encodes continuous intensities into signed integers of `bit_depth` bits.
///
/// The real range of the whole volume is mapped onto the full signed range, so every slice
/// of a volume shares the same rescale parameters. `window` overrides the default window,
/// which covers the real range.
#[allow(clippy::cast_possible_truncation)]
pub fn to_continuous(
	samples: ArrayView3<'_, f32>,
	bit_depth: u16,
	rotation: Rotation,
	window: Option<Window>,
) -> Result<PixelBuffer, TranscodeError> {
	if !(8..=16).contains(&bit_depth) {
		return Err(TranscodeError::UnsupportedBitDepth { bits: bit_depth });
	}
	check_finite(&samples)?;

	let (min, max) = samples
		.iter()
		.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &v| {
			(min.min(f64::from(v)), max.max(f64::from(v)))
		});

	let int_min = -(1_i32 << (bit_depth - 1));
	let int_max = (1_i32 << (bit_depth - 1)) - 1;
	#[allow(clippy::float_cmp)]
	let slope = if max == min {
		1.0
	} else {
		(max - min) / f64::from(int_max - int_min)
	};
	let intercept = min;

	let (rows, columns, values) = frames(&samples, rotation, |v| {
		let stored = ((f64::from(v) - intercept) / slope).round() + f64::from(int_min);
		stored.clamp(f64::from(int_min), f64::from(int_max)) as i16
	});

	let window = window.unwrap_or(Window {
		center: (min + max) / 2.0,
		width: (max - min).max(1.0),
	});

	Ok(PixelBuffer {
		rows,
		columns,
		frames: samples.dim().2,
		samples: Samples::Signed16(values),
		rescale_slope: slope,
		rescale_intercept: intercept,
		stored_min: int_min,
		window,
		bits_allocated: 16,
		bits_stored: bit_depth,
		high_bit: bit_depth - 1,
		pixel_representation: PixelRepresentation::Signed,
	})
}

/// Thresholds samples into a two-valued mask: `foreground` where a sample exceeds
/// `threshold`, zero elsewhere.
///
/// The window is pinned to `(foreground / 2, foreground)` so the mask renders as two flat
/// tones.
pub fn to_binary_mask(
	samples: ArrayView3<'_, f32>,
	threshold: f32,
	foreground: u8,
	rotation: Rotation,
) -> Result<PixelBuffer, TranscodeError> {
	check_finite(&samples)?;

	let (rows, columns, values) = frames(&samples, rotation, |v| {
		if v > threshold {
			foreground
		} else {
			0
		}
	});

	Ok(PixelBuffer {
		rows,
		columns,
		frames: samples.dim().2,
		samples: Samples::Unsigned8(values),
		rescale_slope: 1.0,
		rescale_intercept: 0.0,
		stored_min: 0,
		window: Window {
			center: f64::from(foreground) / 2.0,
			width: f64::from(foreground),
		},
		bits_allocated: 8,
		bits_stored: 8,
		high_bit: 7,
		pixel_representation: PixelRepresentation::Unsigned,
	})
}
