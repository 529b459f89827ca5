//! Binary DICOM Segmentation objects.
//!
//! A mask volume becomes one SEG instance in a series of its own. Frames are ordered by
//! segment, then by slice, and every frame points back at the reference frame it overlays.

use super::{
	image_pixel_elements, str_element, strs_element, uid_element, us_element, AssemblyError,
	DicomInstance, Equipment, ReferenceSeries, SeriesSpec, StudyContext, SEGMENTATION_STORAGE,
};
use crate::geometry::{self, Geometry};
use crate::transcode::to_binary_mask;
use crate::types::{da, decimal_strings, sequence, tm, CodedConcept, Uid};
use crate::volume::Volume;
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Mask samples above this value belong to a segment without a label value.
const MASK_THRESHOLD: f32 = 0.5;

/// How a segment was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlgorithmType {
	#[default]
	Automatic,
	Semiautomatic,
	Manual,
}

impl AlgorithmType {
	pub const fn code(self) -> &'static str {
		match self {
			Self::Automatic => "AUTOMATIC",
			Self::Semiautomatic => "SEMIAUTOMATIC",
			Self::Manual => "MANUAL",
		}
	}
}

/// Identifies the algorithm that produced a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Algorithm {
	pub name: String,
	pub version: String,
	pub family: CodedConcept,
}

impl Default for Algorithm {
	fn default() -> Self {
		Self {
			name: "nnUNet".to_owned(),
			version: "1.0".to_owned(),
			family: CodedConcept::new("111023", "DCM", "Deep Learning"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescription {
	pub label: String,
	pub category: CodedConcept,
	pub property_type: CodedConcept,
	pub algorithm_type: AlgorithmType,
	/// Required unless the segment was drawn manually.
	pub algorithm: Option<Algorithm>,
	/// Voxels equal to this value form the segment. Without one, every voxel above 0.5 does.
	pub label_value: Option<f32>,
}

impl Default for SegmentDescription {
	fn default() -> Self {
		Self {
			label: "Lesion".to_owned(),
			category: CodedConcept::new("T-D0050", "SRT", "Tissue"),
			property_type: CodedConcept::new("M-01010", "SRT", "Lesion"),
			algorithm_type: AlgorithmType::Automatic,
			algorithm: Some(Algorithm::default()),
			label_value: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationOptions {
	pub segments: Vec<SegmentDescription>,
	pub equipment: Equipment,
	pub series_number: u32,
	pub series_description: String,
}

impl Default for SegmentationOptions {
	fn default() -> Self {
		Self {
			segments: vec![SegmentDescription::default()],
			equipment: Equipment {
				manufacturer: "NIfTI-to-DICOM-SEG-Converter".to_owned(),
				model_name: "NIfTI-to-DICOM-SEG-Converter".to_owned(),
				software_versions: "1.0.0".to_owned(),
				device_serial_number: "NotApplicable".to_owned(),
			},
			series_number: 999,
			series_description: "Segmentation".to_owned(),
		}
	}
}

/// Encodes `mask` as a binary segmentation of `reference`.
///
/// The mask must have exactly as many slices as the reference has frames, since viewers pair
/// segmentation frames with reference frames by position.
#[instrument(skip_all, fields(reference = %reference.series_instance_uid))]
pub fn encode(
	study: &StudyContext,
	mask: &Volume,
	reference: &ReferenceSeries,
	options: &SegmentationOptions,
) -> Result<DicomInstance, AssemblyError> {
	let slices = mask.slice_count();
	if slices != reference.slice_count() {
		return Err(AssemblyError::FrameCountMismatch {
			mask: slices,
			reference: reference.slice_count(),
		});
	}
	if options.segments.is_empty() {
		return Err(AssemblyError::MissingIdentity {
			attribute: "SegmentSequence",
		});
	}

	let geometry =
		geometry::resolve_rotated(mask.affine(), mask.samples().dim(), reference.rotation)?;
	let mut frames = Vec::new();
	let mut pixels = None;
	for segment in &options.segments {
		let buffer = match segment.label_value {
			Some(value) => {
				#[allow(clippy::float_cmp)]
				let selected = mask
					.samples()
					.mapv(|sample| if sample == value { 1.0 } else { 0.0 });
				to_binary_mask(selected.view(), MASK_THRESHOLD, 1, reference.rotation)?
			}
			None => to_binary_mask(mask.samples(), MASK_THRESHOLD, 1, reference.rotation)?,
		};
		frames.extend_from_slice(buffer.mask().unwrap_or_default());
		pixels.get_or_insert(buffer);
	}
	let Some(pixels) = pixels else {
		return Err(AssemblyError::EmptyGeometry);
	};
	let number_of_frames = slices * options.segments.len();

	let series = SeriesSpec {
		series_instance_uid: Uid::generate(),
		frame_of_reference_uid: reference.frame_of_reference_uid.clone(),
		series_number: options.series_number,
		modality: "SEG".to_owned(),
		series_description: Some(options.series_description.clone()),
	};

	let mut dataset = InMemDicomObject::from_element_iter(study.elements()?);
	let header = series
		.elements()
		.into_iter()
		.chain(options.equipment.elements())
		.chain(image_pixel_elements(&pixels)?);
	for element in header {
		dataset.put(element);
	}
	// Binary segmentations store one bit per pixel
	dataset.put(us_element(tags::BITS_ALLOCATED, 1));
	dataset.put(us_element(tags::BITS_STORED, 1));
	dataset.put(us_element(tags::HIGH_BIT, 0));
	dataset.put(us_element(tags::PIXEL_REPRESENTATION, 0));

	dataset.put(strs_element(tags::IMAGE_TYPE, VR::CS, &["DERIVED", "PRIMARY"]));
	dataset.put(str_element(tags::INSTANCE_NUMBER, VR::IS, "1"));
	dataset.put(str_element(tags::CONTENT_DATE, VR::DA, &da(study.created.date())));
	dataset.put(str_element(tags::CONTENT_TIME, VR::TM, &tm(study.created)));
	dataset.put(str_element(tags::CONTENT_LABEL, VR::CS, "SEGMENTATION"));
	dataset.put(str_element(
		tags::CONTENT_DESCRIPTION,
		VR::LO,
		&options.series_description,
	));
	dataset.put(str_element(tags::CONTENT_CREATOR_NAME, VR::PN, ""));
	dataset.put(str_element(tags::SEGMENTATION_TYPE, VR::CS, "BINARY"));
	dataset.put(str_element(tags::LOSSY_IMAGE_COMPRESSION, VR::CS, "00"));
	dataset.put(str_element(
		tags::NUMBER_OF_FRAMES,
		VR::IS,
		&number_of_frames.to_string(),
	));

	dataset.put(referenced_series(reference));
	dataset.put(sequence(
		tags::SEGMENT_SEQUENCE,
		options
			.segments
			.iter()
			.enumerate()
			.map(|(index, segment)| segment_item(index + 1, segment))
			.collect::<Result<_, _>>()?,
	));
	for element in dimension_organization() {
		dataset.put(element);
	}
	dataset.put(sequence(
		tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE,
		vec![shared_group(&geometry)?],
	));

	let mut groups = Vec::with_capacity(number_of_frames);
	for segment in 1..=options.segments.len() {
		for slice in 0..slices {
			groups.push(frame_group(segment, slice, &geometry, reference)?);
		}
	}
	dataset.put(sequence(tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE, groups));
	dataset.put(DataElement::new(
		tags::PIXEL_DATA,
		VR::OB,
		PrimitiveValue::from(pack_bits(&frames)),
	));

	debug!(
		frames = number_of_frames,
		segments = options.segments.len(),
		"Assembled segmentation"
	);
	DicomInstance::encode(
		dataset,
		SEGMENTATION_STORAGE,
		Uid::generate(),
		series.series_instance_uid,
		1,
		number_of_frames,
	)
}

/// Packs one byte per pixel into one bit per pixel, least significant bit first.
///
/// Frames are packed back to back without per-frame padding. The result has even length.
pub(crate) fn pack_bits(pixels: &[u8]) -> Vec<u8> {
	let mut packed = vec![0_u8; pixels.len().div_ceil(8)];
	for (index, _) in pixels.iter().enumerate().filter(|(_, &value)| value != 0) {
		packed[index / 8] |= 1 << (index % 8);
	}
	if packed.len() % 2 == 1 {
		packed.push(0);
	}
	packed
}

fn segment_number(number: usize) -> Result<u16, AssemblyError> {
	u16::try_from(number).map_err(|_| AssemblyError::DimensionTooLarge {
		attribute: "SegmentNumber",
		value: number,
	})
}

fn segment_item(
	number: usize,
	segment: &SegmentDescription,
) -> Result<InMemDicomObject, AssemblyError> {
	let mut item = InMemDicomObject::from_element_iter([
		us_element(tags::SEGMENT_NUMBER, segment_number(number)?),
		str_element(tags::SEGMENT_LABEL, VR::LO, &segment.label),
		segment
			.category
			.to_sequence(tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE),
		segment
			.property_type
			.to_sequence(tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE),
		str_element(
			tags::SEGMENT_ALGORITHM_TYPE,
			VR::CS,
			segment.algorithm_type.code(),
		),
	]);

	match (&segment.algorithm, segment.algorithm_type) {
		(Some(algorithm), _) => {
			item.put(str_element(
				tags::SEGMENT_ALGORITHM_NAME,
				VR::LO,
				&algorithm.name,
			));
			let identification = InMemDicomObject::from_element_iter([
				algorithm
					.family
					.to_sequence(tags::ALGORITHM_FAMILY_CODE_SEQUENCE),
				str_element(tags::ALGORITHM_NAME, VR::LO, &algorithm.name),
				str_element(tags::ALGORITHM_VERSION, VR::LO, &algorithm.version),
			]);
			item.put(sequence(
				tags::SEGMENTATION_ALGORITHM_IDENTIFICATION_SEQUENCE,
				vec![identification],
			));
		}
		(None, AlgorithmType::Manual) => {}
		(None, _) => {
			return Err(AssemblyError::MissingIdentity {
				attribute: "SegmentAlgorithmName",
			})
		}
	}
	Ok(item)
}

fn referenced_series(reference: &ReferenceSeries) -> DataElement<InMemDicomObject> {
	let instances = reference
		.instances
		.iter()
		.map(|instance| {
			InMemDicomObject::from_element_iter([
				str_element(
					tags::REFERENCED_SOP_CLASS_UID,
					VR::UI,
					&instance.sop_class_uid,
				),
				uid_element(tags::REFERENCED_SOP_INSTANCE_UID, &instance.sop_instance_uid),
			])
		})
		.collect();
	let series = InMemDicomObject::from_element_iter([
		uid_element(tags::SERIES_INSTANCE_UID, &reference.series_instance_uid),
		sequence(tags::REFERENCED_INSTANCE_SEQUENCE, instances),
	]);
	sequence(tags::REFERENCED_SERIES_SEQUENCE, vec![series])
}

fn shared_group(geometry: &Geometry) -> Result<InMemDicomObject, AssemblyError> {
	let (Some(pixel_spacing), Some(slice_thickness)) =
		(geometry.pixel_spacing(), geometry.slice_thickness())
	else {
		return Err(AssemblyError::EmptyGeometry);
	};
	let measures = InMemDicomObject::from_element_iter([
		decimal_strings(tags::PIXEL_SPACING, &pixel_spacing)?,
		decimal_strings(tags::SLICE_THICKNESS, &[slice_thickness])?,
	]);
	let orientation = InMemDicomObject::from_element_iter([decimal_strings(
		tags::IMAGE_ORIENTATION_PATIENT,
		&geometry.orientation,
	)?]);
	Ok(InMemDicomObject::from_element_iter([
		sequence(tags::PIXEL_MEASURES_SEQUENCE, vec![measures]),
		sequence(tags::PLANE_ORIENTATION_SEQUENCE, vec![orientation]),
	]))
}

fn frame_group(
	segment: usize,
	slice: usize,
	geometry: &Geometry,
	reference: &ReferenceSeries,
) -> Result<InMemDicomObject, AssemblyError> {
	let position = geometry
		.slices
		.get(slice)
		.ok_or(AssemblyError::SliceOutOfRange {
			index: slice,
			count: geometry.slices.len(),
		})?
		.position;
	let (source, frame_number) = reference
		.locate(slice)
		.ok_or(AssemblyError::SliceOutOfRange {
			index: slice,
			count: reference.slice_count(),
		})?;
	let segment = segment_number(segment)?;
	let stack_position = u32::try_from(slice + 1).map_err(|_| AssemblyError::DimensionTooLarge {
		attribute: "DimensionIndexValues",
		value: slice + 1,
	})?;

	let mut source_image = InMemDicomObject::from_element_iter([
		str_element(tags::REFERENCED_SOP_CLASS_UID, VR::UI, &source.sop_class_uid),
		uid_element(tags::REFERENCED_SOP_INSTANCE_UID, &source.sop_instance_uid),
		CodedConcept::new(
			"121322",
			"DCM",
			"Source image for image processing operation",
		)
		.to_sequence(tags::PURPOSE_OF_REFERENCE_CODE_SEQUENCE),
	]);
	if source.number_of_frames > 1 {
		source_image.put(str_element(
			tags::REFERENCED_FRAME_NUMBER,
			VR::IS,
			&frame_number.to_string(),
		));
	}
	let derivation = InMemDicomObject::from_element_iter([
		CodedConcept::new("113076", "DCM", "Segmentation")
			.to_sequence(tags::DERIVATION_CODE_SEQUENCE),
		sequence(tags::SOURCE_IMAGE_SEQUENCE, vec![source_image]),
	]);

	let content = InMemDicomObject::from_element_iter([DataElement::new(
		tags::DIMENSION_INDEX_VALUES,
		VR::UL,
		PrimitiveValue::U32([u32::from(segment), stack_position].into_iter().collect()),
	)]);
	let plane = InMemDicomObject::from_element_iter([decimal_strings(
		tags::IMAGE_POSITION_PATIENT,
		&position,
	)?]);
	let identification =
		InMemDicomObject::from_element_iter([us_element(tags::REFERENCED_SEGMENT_NUMBER, segment)]);

	Ok(InMemDicomObject::from_element_iter([
		sequence(tags::DERIVATION_IMAGE_SEQUENCE, vec![derivation]),
		sequence(tags::FRAME_CONTENT_SEQUENCE, vec![content]),
		sequence(tags::PLANE_POSITION_SEQUENCE, vec![plane]),
		sequence(tags::SEGMENT_IDENTIFICATION_SEQUENCE, vec![identification]),
	]))
}

/// Two dimensions: the segment, then the frame position.
fn dimension_organization() -> [DataElement<InMemDicomObject>; 2] {
	let organization = Uid::generate();
	let pointer = |tag: Tag| PrimitiveValue::Tags(std::iter::once(tag).collect());
	let index = |dimension: Tag, group: Tag| {
		InMemDicomObject::from_element_iter([
			uid_element(tags::DIMENSION_ORGANIZATION_UID, &organization),
			DataElement::new(tags::DIMENSION_INDEX_POINTER, VR::AT, pointer(dimension)),
			DataElement::new(tags::FUNCTIONAL_GROUP_POINTER, VR::AT, pointer(group)),
		])
	};

	[
		sequence(
			tags::DIMENSION_ORGANIZATION_SEQUENCE,
			vec![InMemDicomObject::from_element_iter([uid_element(
				tags::DIMENSION_ORGANIZATION_UID,
				&organization,
			)])],
		),
		sequence(
			tags::DIMENSION_INDEX_SEQUENCE,
			vec![
				index(
					tags::REFERENCED_SEGMENT_NUMBER,
					tags::SEGMENT_IDENTIFICATION_SEQUENCE,
				),
				index(tags::IMAGE_POSITION_PATIENT, tags::PLANE_POSITION_SEQUENCE),
			],
		),
	]
}

#[cfg(test)]
mod tests {
	use super::super::tests::{decode, floats, string, study};
	use super::super::{SourceInstance, MR_IMAGE_STORAGE};
	use super::*;
	use crate::transcode::Rotation;
	use crate::volume::Affine;
	use ndarray::Array3;

	fn items(object: &InMemDicomObject, tag: Tag) -> &[InMemDicomObject] {
		object.element(tag).unwrap().items().unwrap()
	}

	fn reference(frames: &[usize]) -> ReferenceSeries {
		ReferenceSeries {
			series_instance_uid: Uid::generate(),
			frame_of_reference_uid: Uid::generate(),
			instances: frames
				.iter()
				.map(|&number_of_frames| SourceInstance {
					sop_class_uid: MR_IMAGE_STORAGE.to_owned(),
					sop_instance_uid: Uid::generate(),
					number_of_frames,
				})
				.collect(),
			rotation: Rotation::None,
		}
	}

	fn mask(shape: (usize, usize, usize)) -> Volume {
		let samples = Array3::from_shape_fn(shape, |(x, y, _)| if x == y { 1.0 } else { 0.0 });
		Volume::new(samples, Affine::from_scale(1.0, 1.0, 2.0))
	}

	#[test]
	fn frame_count_must_match_the_reference() {
		let mask = mask((4, 4, 3));
		let options = SegmentationOptions::default();

		let result = encode(&study(), &mask, &reference(&[1; 5]), &options);
		assert!(matches!(
			result,
			Err(AssemblyError::FrameCountMismatch {
				mask: 3,
				reference: 5
			})
		));

		let instance = encode(&study(), &mask, &reference(&[1; 3]), &options).unwrap();
		assert_eq!(instance.number_of_frames(), 3);
		let object = decode(&instance);
		assert_eq!(string(&object, tags::NUMBER_OF_FRAMES), "3");
		assert_eq!(items(&object, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE).len(), 3);
	}

	#[test]
	fn segmentation_has_its_own_series() {
		let reference = reference(&[1, 1]);
		let instance = encode(
			&study(),
			&mask((3, 3, 2)),
			&reference,
			&SegmentationOptions::default(),
		)
		.unwrap();
		let object = decode(&instance);

		assert_eq!(instance.sop_class_uid(), SEGMENTATION_STORAGE);
		assert_ne!(instance.series_instance_uid(), &reference.series_instance_uid);
		assert_eq!(string(&object, tags::MODALITY), "SEG");
		assert_eq!(string(&object, tags::SERIES_NUMBER), "999");
		assert_eq!(string(&object, tags::INSTANCE_NUMBER), "1");
		assert_eq!(string(&object, tags::SEGMENTATION_TYPE), "BINARY");
		assert_eq!(string(&object, tags::BITS_ALLOCATED), "1");
		assert_eq!(
			string(&object, tags::FRAME_OF_REFERENCE_UID),
			reference.frame_of_reference_uid.as_str()
		);
		assert_eq!(
			string(&object, tags::MANUFACTURER),
			"NIfTI-to-DICOM-SEG-Converter"
		);

		let referenced = &items(&object, tags::REFERENCED_SERIES_SEQUENCE)[0];
		assert_eq!(
			string(referenced, tags::SERIES_INSTANCE_UID),
			reference.series_instance_uid.as_str()
		);
		assert_eq!(items(referenced, tags::REFERENCED_INSTANCE_SEQUENCE).len(), 2);
	}

	#[test]
	fn geometry_follows_the_reference_rotation() {
		let mut reference = reference(&[1]);
		reference.rotation = Rotation::Cw90;
		let mut samples = Array3::zeros((4, 3, 1));
		samples[[3, 0, 0]] = 1.0;
		let mask = Volume::new(samples, Affine::from_scale(1.0, 1.0, 1.0));
		let instance = encode(&study(), &mask, &reference, &SegmentationOptions::default()).unwrap();
		let object = decode(&instance);

		assert_eq!(string(&object, tags::ROWS), "3");
		assert_eq!(string(&object, tags::COLUMNS), "4");
		let shared = &items(&object, tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE)[0];
		let orientation = &items(shared, tags::PLANE_ORIENTATION_SEQUENCE)[0];
		assert_eq!(
			floats(orientation, tags::IMAGE_ORIENTATION_PATIENT),
			vec![-1.0, 0.0, 0.0, 0.0, 1.0, 0.0]
		);
		let frame = &items(&object, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE)[0];
		let plane = &items(frame, tags::PLANE_POSITION_SEQUENCE)[0];
		assert_eq!(floats(plane, tags::IMAGE_POSITION_PATIENT), vec![3.0, 0.0, 0.0]);

		// The only foreground voxel sits at the frame origin
		let packed = object.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
		assert_eq!(packed[0], 1);
		assert!(packed[1..].iter().all(|&byte| byte == 0));
	}

	#[test]
	fn segment_description_defaults() {
		let instance = encode(
			&study(),
			&mask((2, 2, 1)),
			&reference(&[1]),
			&SegmentationOptions::default(),
		)
		.unwrap();
		let object = decode(&instance);

		let segment = &items(&object, tags::SEGMENT_SEQUENCE)[0];
		assert_eq!(string(segment, tags::SEGMENT_NUMBER), "1");
		assert_eq!(string(segment, tags::SEGMENT_LABEL), "Lesion");
		assert_eq!(string(segment, tags::SEGMENT_ALGORITHM_TYPE), "AUTOMATIC");
		assert_eq!(string(segment, tags::SEGMENT_ALGORITHM_NAME), "nnUNet");
		let category = &items(segment, tags::SEGMENTED_PROPERTY_CATEGORY_CODE_SEQUENCE)[0];
		assert_eq!(string(category, tags::CODE_VALUE), "T-D0050");
		let property = &items(segment, tags::SEGMENTED_PROPERTY_TYPE_CODE_SEQUENCE)[0];
		assert_eq!(string(property, tags::CODE_MEANING), "Lesion");
		let algorithm = &items(segment, tags::SEGMENTATION_ALGORITHM_IDENTIFICATION_SEQUENCE)[0];
		assert_eq!(string(algorithm, tags::ALGORITHM_VERSION), "1.0");
		let family = &items(algorithm, tags::ALGORITHM_FAMILY_CODE_SEQUENCE)[0];
		assert_eq!(string(family, tags::CODE_VALUE), "111023");
	}

	#[test]
	fn automatic_segments_need_an_algorithm() {
		let mut options = SegmentationOptions::default();
		options.segments[0].algorithm = None;
		assert!(matches!(
			encode(&study(), &mask((2, 2, 1)), &reference(&[1]), &options),
			Err(AssemblyError::MissingIdentity { .. })
		));

		options.segments[0].algorithm_type = AlgorithmType::Manual;
		assert!(encode(&study(), &mask((2, 2, 1)), &reference(&[1]), &options).is_ok());
	}

	#[test]
	fn frames_reference_their_source_frames() {
		let reference = reference(&[3]);
		let instance = encode(
			&study(),
			&mask((2, 2, 3)),
			&reference,
			&SegmentationOptions::default(),
		)
		.unwrap();
		let object = decode(&instance);

		let frames = items(&object, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE);
		for (index, frame) in frames.iter().enumerate() {
			let derivation = &items(frame, tags::DERIVATION_IMAGE_SEQUENCE)[0];
			let source = &items(derivation, tags::SOURCE_IMAGE_SEQUENCE)[0];
			assert_eq!(
				string(source, tags::REFERENCED_SOP_INSTANCE_UID),
				reference.instances[0].sop_instance_uid.as_str()
			);
			assert_eq!(
				string(source, tags::REFERENCED_FRAME_NUMBER),
				(index + 1).to_string()
			);
			let identification = &items(frame, tags::SEGMENT_IDENTIFICATION_SEQUENCE)[0];
			assert_eq!(string(identification, tags::REFERENCED_SEGMENT_NUMBER), "1");
		}
	}

	#[test]
	fn label_values_become_separate_segments() {
		let samples = Array3::from_shape_fn((2, 2, 2), |(x, y, _)| (x + y) as f32);
		let mask = Volume::new(samples, Affine::from_scale(1.0, 1.0, 1.0));
		let mut options = SegmentationOptions::default();
		options.segments = vec![
			SegmentDescription {
				label_value: Some(1.0),
				..SegmentDescription::default()
			},
			SegmentDescription {
				label: "Edema".to_owned(),
				label_value: Some(2.0),
				..SegmentDescription::default()
			},
		];

		let instance = encode(&study(), &mask, &reference(&[1, 1]), &options).unwrap();
		assert_eq!(instance.number_of_frames(), 4);

		let object = decode(&instance);
		let frames = items(&object, tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE);
		let segments: Vec<String> = frames
			.iter()
			.map(|frame| {
				let identification = &items(frame, tags::SEGMENT_IDENTIFICATION_SEQUENCE)[0];
				string(identification, tags::REFERENCED_SEGMENT_NUMBER)
			})
			.collect();
		assert_eq!(segments, ["1", "1", "2", "2"]);

		// Per frame: value 1 at (0,1) and (1,0), value 2 at (1,1)
		let data = object.element(tags::PIXEL_DATA).unwrap().to_bytes().unwrap();
		assert_eq!(&data[..], &[0b0110_0110, 0b1000_1000]);
	}

	#[test]
	fn bits_are_packed_lsb_first_with_even_length() {
		assert_eq!(pack_bits(&[0, 0, 1, 0, 0, 0, 0, 0]), vec![0b100, 0]);
		assert_eq!(pack_bits(&[1; 9]), vec![0xFF, 0b1]);
		assert_eq!(pack_bits(&[1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 1]).len(), 4);
	}
}
