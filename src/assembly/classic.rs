//! One single-frame instance per slice.

use super::{
	check_frames, image_pixel_elements, pixel_data_element, rescale_elements, str_element,
	strs_element, window_elements, AssemblyError, DicomInstance, SeriesSpec, StudyContext,
	MR_IMAGE_STORAGE, SECONDARY_CAPTURE_IMAGE_STORAGE,
};
use crate::geometry::Geometry;
use crate::transcode::PixelBuffer;
use crate::types::{da, decimal_strings, tm, Uid};
use dicom::core::{DataElement, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

/// Builds the instances of one classic series.
///
/// Study, series and image pixel attributes are prepared once. Each slice can then be
/// assembled independently, in any order and from any thread.
pub struct ClassicAssembler<'a> {
	series: &'a SeriesSpec,
	geometry: &'a Geometry,
	pixels: &'a PixelBuffer,
	sop_class_uid: &'static str,
	shared: Vec<DataElement<InMemDicomObject>>,
}

impl<'a> ClassicAssembler<'a> {
	pub fn new(
		study: &StudyContext,
		series: &'a SeriesSpec,
		geometry: &'a Geometry,
		pixels: &'a PixelBuffer,
	) -> Result<Self, AssemblyError> {
		check_frames(pixels, geometry.slices.len())?;

		let sop_class_uid = if series.modality == "MR" {
			MR_IMAGE_STORAGE
		} else {
			SECONDARY_CAPTURE_IMAGE_STORAGE
		};

		let mut shared = study.elements()?;
		shared.extend(series.elements());
		shared.extend([
			strs_element(tags::IMAGE_TYPE, VR::CS, &["DERIVED", "PRIMARY"]),
			str_element(tags::CONTENT_DATE, VR::DA, &da(study.created.date())),
			str_element(tags::CONTENT_TIME, VR::TM, &tm(study.created)),
			str_element(tags::BURNED_IN_ANNOTATION, VR::CS, "NO"),
			decimal_strings(tags::IMAGE_ORIENTATION_PATIENT, &geometry.orientation)?,
		]);
		if sop_class_uid == MR_IMAGE_STORAGE {
			shared.extend([
				str_element(tags::SCANNING_SEQUENCE, VR::CS, "RM"),
				str_element(tags::SEQUENCE_VARIANT, VR::CS, "NONE"),
				str_element(tags::SCAN_OPTIONS, VR::CS, ""),
				str_element(tags::MR_ACQUISITION_TYPE, VR::CS, "3D"),
			]);
		} else {
			shared.push(str_element(tags::CONVERSION_TYPE, VR::CS, "WSD"));
		}
		shared.extend(image_pixel_elements(pixels)?);
		shared.extend(rescale_elements(pixels)?);
		shared.extend(window_elements(pixels)?);

		Ok(Self {
			series,
			geometry,
			pixels,
			sop_class_uid,
			shared,
		})
	}

	/// Number of instances in the series.
	pub fn len(&self) -> usize {
		self.geometry.slices.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Assembles the instance for slice `index` with a fresh SOP Instance UID.
	pub fn instance(&self, index: usize) -> Result<DicomInstance, AssemblyError> {
		let slice = self
			.geometry
			.slices
			.get(index)
			.ok_or(AssemblyError::SliceOutOfRange {
				index,
				count: self.len(),
			})?;
		let instance_number = u32::try_from(index + 1).map_err(|_| {
			AssemblyError::DimensionTooLarge {
				attribute: "InstanceNumber",
				value: index + 1,
			}
		})?;

		let mut dataset = InMemDicomObject::from_element_iter(self.shared.iter().cloned());
		dataset.put(str_element(
			tags::INSTANCE_NUMBER,
			VR::IS,
			&instance_number.to_string(),
		));
		dataset.put(decimal_strings(tags::IMAGE_POSITION_PATIENT, &slice.position)?);
		dataset.put(decimal_strings(tags::PIXEL_SPACING, &slice.pixel_spacing)?);
		dataset.put(decimal_strings(tags::SLICE_THICKNESS, &[slice.slice_thickness])?);
		dataset.put(pixel_data_element(
			self.pixels.bits_allocated,
			self.pixels.frame_bytes(index),
		));

		DicomInstance::encode(
			dataset,
			self.sop_class_uid,
			Uid::generate(),
			self.series.series_instance_uid.clone(),
			instance_number,
			1,
		)
	}

	/// Assembles every slice in order.
	pub fn instances(&self) -> impl Iterator<Item = Result<DicomInstance, AssemblyError>> + '_ {
		(0..self.len()).map(|index| self.instance(index))
	}
}

#[cfg(test)]
mod tests {
	use super::super::tests::{decode, floats, string, study};
	use super::*;
	use crate::geometry;
	use crate::transcode::{to_binary_mask, to_continuous, Rotation};
	use crate::volume::{Affine, Volume};
	use ndarray::Array3;
	use std::collections::HashSet;

	fn volume(shape: (usize, usize, usize), affine: Affine) -> Volume {
		let samples = Array3::from_shape_fn(shape, |(x, y, z)| (x * 100 + y * 10 + z) as f32);
		Volume::new(samples, affine)
	}

	fn assemble(volume: &Volume, modality: &str) -> (SeriesSpec, Vec<DicomInstance>) {
		let study = study();
		let series = SeriesSpec::new(modality, 1, Some("FLAIR"));
		let geometry = geometry::resolve(volume.affine(), volume.slice_count()).unwrap();
		let pixels = to_continuous(volume.samples(), 16, Rotation::None, None).unwrap();
		let assembler = ClassicAssembler::new(&study, &series, &geometry, &pixels).unwrap();
		let instances = assembler.instances().collect::<Result<Vec<_>, _>>().unwrap();
		(series, instances)
	}

	#[test]
	fn one_instance_per_slice() {
		let volume = volume((4, 4, 2), Affine::from_scale(1.0, 1.0, 2.0));
		let (_, instances) = assemble(&volume, "MR");
		assert_eq!(instances.len(), 2);

		let first = decode(&instances[0]);
		let second = decode(&instances[1]);
		assert_eq!(floats(&first, tags::IMAGE_POSITION_PATIENT), vec![0.0, 0.0, 0.0]);
		assert_eq!(floats(&second, tags::IMAGE_POSITION_PATIENT), vec![0.0, 0.0, 2.0]);
		assert_eq!(floats(&first, tags::PIXEL_SPACING), vec![1.0, 1.0]);
		assert_eq!(floats(&first, tags::SLICE_THICKNESS), vec![2.0]);
		assert_eq!(
			floats(&first, tags::IMAGE_ORIENTATION_PATIENT),
			floats(&second, tags::IMAGE_ORIENTATION_PATIENT)
		);
		assert_eq!(string(&first, tags::INSTANCE_NUMBER), "1");
		assert_eq!(string(&second, tags::INSTANCE_NUMBER), "2");
		assert_eq!(string(&first, tags::SOP_CLASS_UID), MR_IMAGE_STORAGE);
		assert_eq!(string(&first, tags::PATIENT_ID), "PID-42");
		assert_eq!(first.meta().transfer_syntax(), "1.2.840.10008.1.2.1");
	}

	#[test]
	fn uids_are_unique_per_instance_and_shared_per_series() {
		let volume = volume((3, 2, 6), Affine::from_scale(0.7, 0.7, 1.5));
		let (series, instances) = assemble(&volume, "MR");

		let sop_uids: HashSet<_> = instances
			.iter()
			.map(|instance| string(&decode(instance), tags::SOP_INSTANCE_UID))
			.collect();
		assert_eq!(sop_uids.len(), 6);

		for instance in &instances {
			let object = decode(instance);
			assert_eq!(
				string(&object, tags::SERIES_INSTANCE_UID),
				series.series_instance_uid.as_str()
			);
			assert_eq!(instance.series_instance_uid(), &series.series_instance_uid);
			assert_eq!(
				object.meta().media_storage_sop_instance_uid().trim_end_matches('\0'),
				instance.sop_instance_uid().as_str()
			);
		}
	}

	#[test]
	fn pixel_data_decodes_to_source_values() {
		let volume = volume((3, 4, 2), Affine::from_scale(1.0, 1.0, 1.0));
		let (_, instances) = assemble(&volume, "MR");
		let object = decode(&instances[1]);

		let slope = floats(&object, tags::RESCALE_SLOPE)[0];
		let intercept = floats(&object, tags::RESCALE_INTERCEPT)[0];
		let bytes = object.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
		assert_eq!(bytes.len(), 3 * 4 * 2);

		let stored: Vec<i16> = bytes
			.chunks_exact(2)
			.map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
			.collect();
		for x in 0..3 {
			for y in 0..4 {
				let expected = f64::from(volume.samples()[[x, y, 1]]);
				let decoded = f64::from(stored[x * 4 + y]).mul_add(slope, intercept);
				assert!((decoded - expected).abs() < 0.01, "{decoded} != {expected}");
			}
		}
		assert_eq!(string(&object, tags::ROWS), "3");
		assert_eq!(string(&object, tags::COLUMNS), "4");
	}

	#[test]
	fn masks_become_secondary_capture_images() {
		let volume = volume((2, 2, 2), Affine::from_scale(1.0, 1.0, 1.0));
		let study = study();
		let series = SeriesSpec::new("OT", 2, Some("SEG"));
		let geometry = geometry::resolve(volume.affine(), 2).unwrap();
		let pixels = to_binary_mask(volume.samples(), 0.5, 255, Rotation::None).unwrap();
		let assembler = ClassicAssembler::new(&study, &series, &geometry, &pixels).unwrap();

		let object = decode(&assembler.instance(0).unwrap());
		assert_eq!(string(&object, tags::SOP_CLASS_UID), SECONDARY_CAPTURE_IMAGE_STORAGE);
		assert_eq!(floats(&object, tags::WINDOW_CENTER), vec![127.5]);
		assert_eq!(floats(&object, tags::WINDOW_WIDTH), vec![255.0]);
		assert_eq!(string(&object, tags::BITS_ALLOCATED), "8");

		assert!(matches!(
			assembler.instance(2),
			Err(AssemblyError::SliceOutOfRange { index: 2, count: 2 })
		));
	}

	#[test]
	fn geometry_and_pixels_must_agree() {
		let volume = volume((2, 2, 3), Affine::from_scale(1.0, 1.0, 1.0));
		let study = study();
		let series = SeriesSpec::new("MR", 1, None);
		let geometry = geometry::resolve(volume.affine(), 2).unwrap();
		let pixels = to_continuous(volume.samples(), 16, Rotation::None, None).unwrap();

		assert!(matches!(
			ClassicAssembler::new(&study, &series, &geometry, &pixels),
			Err(AssemblyError::InconsistentFrames { frames: 3, slices: 2 })
		));
	}
}
