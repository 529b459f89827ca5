//! One multi-frame Enhanced MR instance per volume.
//!
//! Orientation, spacing, rescale and window are volume invariant and live in the shared
//! functional group only. The per-frame groups carry nothing but the frame position and its
//! place in the stack.

use super::{
	check_frames, image_pixel_elements, pixel_data_element, rescale_elements, str_element,
	strs_element, uid_element, window_elements, AssemblyError, DicomInstance, Equipment,
	SeriesSpec, StudyContext, ENHANCED_MR_IMAGE_STORAGE,
};
use crate::geometry::{Geometry, SliceGeometry};
use crate::transcode::{PixelBuffer, PixelRepresentation};
use crate::types::{da, decimal_strings, sequence, tm, Uid};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use tracing::debug;

const STACK_ID: &str = "1";
const IMAGE_TYPE: [&str; 4] = ["DERIVED", "PRIMARY", "VOLUME", "NONE"];

/// Assembles the whole volume into a single instance with one frame per slice.
///
/// Only MR series with signed continuous pixels fit the Enhanced MR IOD. Masks go through the
/// classic assembler or the segmentation encoder instead.
pub fn assemble(
	study: &StudyContext,
	series: &SeriesSpec,
	equipment: &Equipment,
	geometry: &Geometry,
	pixels: &PixelBuffer,
) -> Result<DicomInstance, AssemblyError> {
	if series.modality != "MR" || pixels.pixel_representation != PixelRepresentation::Signed {
		return Err(AssemblyError::UnsupportedModality {
			modality: series.modality.clone(),
		});
	}
	check_frames(pixels, geometry.slices.len())?;
	let (Some(pixel_spacing), Some(slice_thickness)) =
		(geometry.pixel_spacing(), geometry.slice_thickness())
	else {
		return Err(AssemblyError::EmptyGeometry);
	};

	let mut dataset = InMemDicomObject::from_element_iter(study.elements()?);
	for element in series.elements().into_iter().chain(equipment.elements()) {
		dataset.put(element);
	}
	for element in image_pixel_elements(pixels)? {
		dataset.put(element);
	}

	let acquired = format!("{}{}", da(study.created.date()), tm(study.created));
	dataset.put(strs_element(tags::IMAGE_TYPE, VR::CS, &IMAGE_TYPE));
	dataset.put(str_element(tags::INSTANCE_NUMBER, VR::IS, "1"));
	dataset.put(str_element(tags::CONTENT_DATE, VR::DA, &da(study.created.date())));
	dataset.put(str_element(tags::CONTENT_TIME, VR::TM, &tm(study.created)));
	dataset.put(str_element(tags::ACQUISITION_DATE_TIME, VR::DT, &acquired));
	dataset.put(DataElement::new(
		tags::ACQUISITION_DURATION,
		VR::FD,
		PrimitiveValue::from(0.0_f64),
	));
	dataset.put(str_element(tags::CONTENT_QUALIFICATION, VR::CS, "RESEARCH"));
	dataset.put(str_element(tags::BURNED_IN_ANNOTATION, VR::CS, "NO"));
	dataset.put(str_element(tags::LOSSY_IMAGE_COMPRESSION, VR::CS, "00"));
	dataset.put(str_element(tags::PRESENTATION_LUT_SHAPE, VR::CS, "IDENTITY"));
	for element in frame_characteristics() {
		dataset.put(element);
	}
	dataset.put(str_element(
		tags::NUMBER_OF_FRAMES,
		VR::IS,
		&pixels.frames.to_string(),
	));

	for element in dimension_organization() {
		dataset.put(element);
	}
	dataset.put(sequence(
		tags::SHARED_FUNCTIONAL_GROUPS_SEQUENCE,
		vec![shared_group(geometry, pixel_spacing, slice_thickness, pixels)?],
	));
	dataset.put(sequence(
		tags::PER_FRAME_FUNCTIONAL_GROUPS_SEQUENCE,
		geometry
			.slices
			.iter()
			.enumerate()
			.map(|(index, slice)| frame_group(index, slice))
			.collect::<Result<_, _>>()?,
	));
	dataset.put(pixel_data_element(pixels.bits_allocated, pixels.to_bytes()));

	debug!(
		frames = pixels.frames,
		series = %series.series_instance_uid,
		"Assembled enhanced instance"
	);
	DicomInstance::encode(
		dataset,
		ENHANCED_MR_IMAGE_STORAGE,
		Uid::generate(),
		series.series_instance_uid.clone(),
		1,
		pixels.frames,
	)
}

/// Characteristics stated both on the image and in the MR Image Frame Type macro.
fn frame_characteristics() -> [DataElement<InMemDicomObject>; 5] {
	[
		str_element(tags::PIXEL_PRESENTATION, VR::CS, "MONOCHROME"),
		str_element(tags::VOLUMETRIC_PROPERTIES, VR::CS, "VOLUME"),
		str_element(tags::VOLUME_BASED_CALCULATION_TECHNIQUE, VR::CS, "NONE"),
		str_element(tags::COMPLEX_IMAGE_COMPONENT, VR::CS, "MAGNITUDE"),
		str_element(tags::ACQUISITION_CONTRAST, VR::CS, "UNKNOWN"),
	]
}

fn shared_group(
	geometry: &Geometry,
	pixel_spacing: [f64; 2],
	slice_thickness: f64,
	pixels: &PixelBuffer,
) -> Result<InMemDicomObject, AssemblyError> {
	let measures = InMemDicomObject::from_element_iter([
		decimal_strings(tags::PIXEL_SPACING, &pixel_spacing)?,
		decimal_strings(tags::SLICE_THICKNESS, &[slice_thickness])?,
	]);
	let orientation = InMemDicomObject::from_element_iter([decimal_strings(
		tags::IMAGE_ORIENTATION_PATIENT,
		&geometry.orientation,
	)?]);
	let transformation = InMemDicomObject::from_element_iter(rescale_elements(pixels)?);
	let window = InMemDicomObject::from_element_iter(window_elements(pixels)?);
	let mut frame_type = InMemDicomObject::from_element_iter(frame_characteristics());
	frame_type.put(strs_element(tags::FRAME_TYPE, VR::CS, &IMAGE_TYPE));

	Ok(InMemDicomObject::from_element_iter([
		sequence(tags::PIXEL_MEASURES_SEQUENCE, vec![measures]),
		sequence(tags::PLANE_ORIENTATION_SEQUENCE, vec![orientation]),
		sequence(tags::PIXEL_VALUE_TRANSFORMATION_SEQUENCE, vec![transformation]),
		sequence(tags::FRAME_VOILUT_SEQUENCE, vec![window]),
		sequence(tags::MR_IMAGE_FRAME_TYPE_SEQUENCE, vec![frame_type]),
	]))
}

fn frame_group(index: usize, slice: &SliceGeometry) -> Result<InMemDicomObject, AssemblyError> {
	let position = u32::try_from(index + 1).map_err(|_| AssemblyError::DimensionTooLarge {
		attribute: "InStackPositionNumber",
		value: index + 1,
	})?;

	let content = InMemDicomObject::from_element_iter([
		str_element(tags::STACK_ID, VR::SH, STACK_ID),
		DataElement::new(
			tags::IN_STACK_POSITION_NUMBER,
			VR::UL,
			PrimitiveValue::from(position),
		),
		DataElement::new(
			tags::DIMENSION_INDEX_VALUES,
			VR::UL,
			PrimitiveValue::U32([1, position].into_iter().collect()),
		),
	]);
	let plane = InMemDicomObject::from_element_iter([decimal_strings(
		tags::IMAGE_POSITION_PATIENT,
		&slice.position,
	)?]);

	Ok(InMemDicomObject::from_element_iter([
		sequence(tags::FRAME_CONTENT_SEQUENCE, vec![content]),
		sequence(tags::PLANE_POSITION_SEQUENCE, vec![plane]),
	]))
}

/// A stack dimension: Stack ID, then In-Stack Position Number.
fn dimension_organization() -> [DataElement<InMemDicomObject>; 2] {
	let organization = Uid::generate();
	let pointer = |tag: Tag| PrimitiveValue::Tags(std::iter::once(tag).collect());
	let index = |tag: Tag| {
		InMemDicomObject::from_element_iter([
			uid_element(tags::DIMENSION_ORGANIZATION_UID, &organization),
			DataElement::new(tags::DIMENSION_INDEX_POINTER, VR::AT, pointer(tag)),
			DataElement::new(
				tags::FUNCTIONAL_GROUP_POINTER,
				VR::AT,
				pointer(tags::FRAME_CONTENT_SEQUENCE),
			),
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
			vec![index(tags::STACK_ID), index(tags::IN_STACK_POSITION_NUMBER)],
		),
	]
}
