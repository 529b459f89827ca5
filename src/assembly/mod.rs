//! Construction of encoded DICOM instances.
//!
//! Every instance is built from named, typed values into a fresh dataset and encoded right
//! away. Nothing is copied from a template, and an encoded [`DicomInstance`] never changes.

pub mod classic;
pub mod enhanced;
pub mod reidentify;
pub mod segmentation;

use crate::geometry::GeometryError;
use crate::transcode::{PixelBuffer, TranscodeError};
use crate::types::{da, decimal_strings, tm, DecimalStringError, PersonName, Sex, Uid};
use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime};
use dicom::core::{DataElement, PrimitiveValue, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const MR_IMAGE_STORAGE: &str = uids::MR_IMAGE_STORAGE;
pub const ENHANCED_MR_IMAGE_STORAGE: &str = uids::ENHANCED_MR_IMAGE_STORAGE;
pub const SECONDARY_CAPTURE_IMAGE_STORAGE: &str = uids::SECONDARY_CAPTURE_IMAGE_STORAGE;
pub const SEGMENTATION_STORAGE: &str = uids::SEGMENTATION_STORAGE;

const PLACEHOLDER_BIRTH_DATE: &str = "19000101";
const PLACEHOLDER_SEX: &str = "O";
const PLACEHOLDER_ACCESSION_NUMBER: &str = "00000000";
const PLACEHOLDER_STUDY_ID: &str = "1";
const PLACEHOLDER_PATIENT_ID: &str = "ANONYMOUS";
const PLACEHOLDER_PATIENT_NAME: &str = "Anonymous";

#[derive(Debug, Error)]
pub enum AssemblyError {
	#[error("Required attribute {attribute} is missing")]
	MissingIdentity { attribute: &'static str },
	#[error("Mask has {mask} slices but the referenced series has {reference}")]
	FrameCountMismatch { mask: usize, reference: usize },
	#[error("Pixel data has {frames} frames but the geometry describes {slices} slices")]
	InconsistentFrames { frames: usize, slices: usize },
	#[error("Modality {modality} cannot be stored as Enhanced MR")]
	UnsupportedModality { modality: String },
	#[error("Geometry describes no slices")]
	EmptyGeometry,
	#[error("Slice index {index} is out of range for {count} slices")]
	SliceOutOfRange { index: usize, count: usize },
	#[error("{attribute} of {value} exceeds the DICOM limit")]
	DimensionTooLarge { attribute: &'static str, value: usize },
	#[error("Input instance is missing {attribute}")]
	MissingAttribute { attribute: &'static str },
	#[error(transparent)]
	Geometry(#[from] GeometryError),
	#[error(transparent)]
	Transcode(#[from] TranscodeError),
	#[error(transparent)]
	Value(#[from] DecimalStringError),
	#[error("Failed to read DICOM input")]
	Parse {
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	#[error("Failed to encode DICOM instance")]
	Encode {
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
}

/// How absent patient identity fields are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityPolicy {
	/// Fill absent fields with anonymous placeholders.
	#[default]
	Placeholders,
	/// Fail when the patient id or name is absent.
	Strict,
}

/// Patient identity as supplied by the patient record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientIdentity {
	pub external_id: Option<String>,
	pub display_name: Option<String>,
	pub birth_date: Option<NaiveDate>,
	pub sex: Option<Sex>,
}

impl PatientIdentity {
	pub fn new(external_id: &str, display_name: &str) -> Self {
		let non_empty = |value: &str| Some(value.trim().to_owned()).filter(|v| !v.is_empty());
		Self {
			external_id: non_empty(external_id),
			display_name: non_empty(display_name),
			birth_date: None,
			sex: None,
		}
	}
}

/// Identifiers shared by every instance produced for one conversion request.
///
/// Built once per request and only read afterwards.
#[derive(Debug, Clone)]
pub struct StudyContext {
	pub study_instance_uid: Uid,
	pub patient: PatientIdentity,
	pub accession_number: Option<String>,
	pub study_id: Option<String>,
	pub study_description: Option<String>,
	pub created: NaiveDateTime,
	pub identity_policy: IdentityPolicy,
}

impl StudyContext {
	/// Uses `study_instance_uid` when it is a valid UID and generates one otherwise.
	pub fn new(
		patient: PatientIdentity,
		study_instance_uid: Option<&str>,
		identity_policy: IdentityPolicy,
	) -> Self {
		Self {
			study_instance_uid: Uid::or_generate(study_instance_uid),
			patient,
			accession_number: None,
			study_id: None,
			study_description: None,
			created: chrono::Local::now().naive_local(),
			identity_policy,
		}
	}

	pub fn patient_id(&self) -> Result<&str, AssemblyError> {
		match (&self.patient.external_id, self.identity_policy) {
			(Some(id), _) => Ok(id),
			(None, IdentityPolicy::Placeholders) => Ok(PLACEHOLDER_PATIENT_ID),
			(None, IdentityPolicy::Strict) => Err(AssemblyError::MissingIdentity {
				attribute: "PatientID",
			}),
		}
	}

	fn patient_name(&self) -> Result<PersonName, AssemblyError> {
		match (&self.patient.display_name, self.identity_policy) {
			(Some(name), _) => Ok(PersonName::from_display(name)),
			(None, IdentityPolicy::Placeholders) => {
				Ok(PersonName::from_display(PLACEHOLDER_PATIENT_NAME))
			}
			(None, IdentityPolicy::Strict) => Err(AssemblyError::MissingIdentity {
				attribute: "PatientName",
			}),
		}
	}

	/// Patient and General Study module attributes.
	pub(crate) fn elements(&self) -> Result<Vec<DataElement<InMemDicomObject>>, AssemblyError> {
		let patient_id = self.patient_id()?;
		let patient_name = self.patient_name()?;
		if self.patient.external_id.is_none() || self.patient.display_name.is_none() {
			warn!(
				study = %self.study_instance_uid,
				"Using placeholders for missing patient identity"
			);
		}

		let birth_date = self
			.patient
			.birth_date
			.map_or_else(|| PLACEHOLDER_BIRTH_DATE.to_owned(), da);
		let sex = self.patient.sex.map_or(PLACEHOLDER_SEX, Sex::code);

		Ok(vec![
			str_element(tags::SPECIFIC_CHARACTER_SET, VR::CS, "ISO_IR 192"),
			str_element(tags::PATIENT_NAME, VR::PN, patient_name.as_str()),
			str_element(tags::PATIENT_ID, VR::LO, patient_id),
			str_element(tags::PATIENT_BIRTH_DATE, VR::DA, &birth_date),
			str_element(tags::PATIENT_SEX, VR::CS, sex),
			uid_element(tags::STUDY_INSTANCE_UID, &self.study_instance_uid),
			str_element(tags::STUDY_DATE, VR::DA, &da(self.created.date())),
			str_element(tags::STUDY_TIME, VR::TM, &tm(self.created)),
			str_element(
				tags::ACCESSION_NUMBER,
				VR::SH,
				self.accession_number
					.as_deref()
					.unwrap_or(PLACEHOLDER_ACCESSION_NUMBER),
			),
			str_element(
				tags::STUDY_ID,
				VR::SH,
				self.study_id.as_deref().unwrap_or(PLACEHOLDER_STUDY_ID),
			),
			str_element(tags::REFERRING_PHYSICIAN_NAME, VR::PN, ""),
			str_element(
				tags::STUDY_DESCRIPTION,
				VR::LO,
				self.study_description.as_deref().unwrap_or_default(),
			),
		])
	}
}

/// Series level identity of the instances produced from one volume.
#[derive(Debug, Clone)]
pub struct SeriesSpec {
	pub series_instance_uid: Uid,
	pub frame_of_reference_uid: Uid,
	pub series_number: u32,
	pub modality: String,
	pub series_description: Option<String>,
}

impl SeriesSpec {
	/// A new series with freshly generated series and frame of reference UIDs.
	pub fn new(modality: &str, series_number: u32, series_description: Option<&str>) -> Self {
		Self {
			series_instance_uid: Uid::generate(),
			frame_of_reference_uid: Uid::generate(),
			series_number,
			modality: modality.to_owned(),
			series_description: series_description.map(ToOwned::to_owned),
		}
	}

	/// General Series and Frame of Reference module attributes.
	pub(crate) fn elements(&self) -> Vec<DataElement<InMemDicomObject>> {
		vec![
			str_element(tags::MODALITY, VR::CS, &self.modality),
			uid_element(tags::SERIES_INSTANCE_UID, &self.series_instance_uid),
			str_element(tags::SERIES_NUMBER, VR::IS, &self.series_number.to_string()),
			str_element(
				tags::SERIES_DESCRIPTION,
				VR::LO,
				self.series_description.as_deref().unwrap_or_default(),
			),
			uid_element(tags::FRAME_OF_REFERENCE_UID, &self.frame_of_reference_uid),
			str_element(tags::POSITION_REFERENCE_INDICATOR, VR::LO, ""),
		]
	}
}

/// General and Enhanced General Equipment attributes of generated objects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Equipment {
	pub manufacturer: String,
	pub model_name: String,
	pub software_versions: String,
	pub device_serial_number: String,
}

impl Default for Equipment {
	fn default() -> Self {
		Self {
			manufacturer: "vol2dcm".to_owned(),
			model_name: "vol2dcm".to_owned(),
			software_versions: env!("CARGO_PKG_VERSION").to_owned(),
			device_serial_number: "NotApplicable".to_owned(),
		}
	}
}

impl Equipment {
	pub(crate) fn elements(&self) -> Vec<DataElement<InMemDicomObject>> {
		vec![
			str_element(tags::MANUFACTURER, VR::LO, &self.manufacturer),
			str_element(tags::MANUFACTURER_MODEL_NAME, VR::LO, &self.model_name),
			str_element(tags::DEVICE_SERIAL_NUMBER, VR::LO, &self.device_serial_number),
			str_element(tags::SOFTWARE_VERSIONS, VR::LO, &self.software_versions),
		]
	}
}

/// One encoded DICOM instance.
#[derive(Debug, Clone)]
pub struct DicomInstance {
	sop_class_uid: String,
	sop_instance_uid: Uid,
	series_instance_uid: Uid,
	instance_number: u32,
	number_of_frames: usize,
	bytes: Bytes,
}

impl DicomInstance {
	/// Encodes `dataset` as a DICOM file (preamble, file meta group and data set) using
	/// Explicit VR Little Endian.
	pub(crate) fn encode(
		dataset: InMemDicomObject,
		sop_class_uid: &str,
		sop_instance_uid: Uid,
		series_instance_uid: Uid,
		instance_number: u32,
		number_of_frames: usize,
	) -> Result<Self, AssemblyError> {
		Self::encode_as(
			dataset,
			uids::EXPLICIT_VR_LITTLE_ENDIAN,
			sop_class_uid,
			sop_instance_uid,
			series_instance_uid,
			instance_number,
			number_of_frames,
		)
	}

	/// Like [`DicomInstance::encode`], but with an explicit transfer syntax.
	pub(crate) fn encode_as(
		mut dataset: InMemDicomObject,
		transfer_syntax: &str,
		sop_class_uid: &str,
		sop_instance_uid: Uid,
		series_instance_uid: Uid,
		instance_number: u32,
		number_of_frames: usize,
	) -> Result<Self, AssemblyError> {
		dataset.put(str_element(tags::SOP_CLASS_UID, VR::UI, sop_class_uid));
		dataset.put(uid_element(tags::SOP_INSTANCE_UID, &sop_instance_uid));

		let meta = FileMetaTableBuilder::new()
			.transfer_syntax(transfer_syntax)
			.media_storage_sop_class_uid(sop_class_uid)
			.media_storage_sop_instance_uid(sop_instance_uid.as_str())
			.implementation_class_uid(crate::IMPLEMENTATION_CLASS_UID)
			.implementation_version_name(crate::IMPLEMENTATION_VERSION_NAME);
		let file = dataset
			.with_meta(meta)
			.map_err(|err| AssemblyError::Encode {
				source: Box::new(err),
			})?;

		let mut buffer = Vec::new();
		file.write_all(&mut buffer)
			.map_err(|err| AssemblyError::Encode {
				source: Box::new(err),
			})?;

		Ok(Self {
			sop_class_uid: sop_class_uid.to_owned(),
			sop_instance_uid,
			series_instance_uid,
			instance_number,
			number_of_frames,
			bytes: Bytes::from(buffer),
		})
	}

	pub fn sop_class_uid(&self) -> &str {
		&self.sop_class_uid
	}

	pub const fn sop_instance_uid(&self) -> &Uid {
		&self.sop_instance_uid
	}

	pub const fn series_instance_uid(&self) -> &Uid {
		&self.series_instance_uid
	}

	pub const fn instance_number(&self) -> u32 {
		self.instance_number
	}

	pub const fn number_of_frames(&self) -> usize {
		self.number_of_frames
	}

	/// The complete encoded file. Cloning is cheap.
	pub fn bytes(&self) -> Bytes {
		self.bytes.clone()
	}
}

/// One source instance a segmentation is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInstance {
	pub sop_class_uid: String,
	pub sop_instance_uid: Uid,
	/// Frames within the instance. Classic instances have one.
	pub number_of_frames: usize,
}

/// The image series a segmentation points back at.
#[derive(Debug, Clone)]
pub struct ReferenceSeries {
	pub series_instance_uid: Uid,
	pub frame_of_reference_uid: Uid,
	/// Source instances in slice order.
	pub instances: Vec<SourceInstance>,
	/// In-plane rotation the reference pixel data was produced with.
	pub rotation: crate::transcode::Rotation,
}

impl ReferenceSeries {
	pub fn slice_count(&self) -> usize {
		self.instances.iter().map(|i| i.number_of_frames).sum()
	}

	/// Maps a slice index onto the source instance and its 1-based frame number.
	pub(crate) fn locate(&self, slice: usize) -> Option<(&SourceInstance, usize)> {
		let mut remaining = slice;
		for instance in &self.instances {
			if remaining < instance.number_of_frames {
				return Some((instance, remaining + 1));
			}
			remaining -= instance.number_of_frames;
		}
		None
	}

	/// References instances assembled earlier in the same request.
	pub fn from_assembled(
		series: &SeriesSpec,
		instances: &[DicomInstance],
		rotation: crate::transcode::Rotation,
	) -> Self {
		let mut instances: Vec<&DicomInstance> = instances.iter().collect();
		instances.sort_by_key(|instance| instance.instance_number());
		Self {
			series_instance_uid: series.series_instance_uid.clone(),
			frame_of_reference_uid: series.frame_of_reference_uid.clone(),
			instances: instances
				.into_iter()
				.map(|instance| SourceInstance {
					sop_class_uid: instance.sop_class_uid().to_owned(),
					sop_instance_uid: instance.sop_instance_uid().clone(),
					number_of_frames: instance.number_of_frames(),
				})
				.collect(),
			rotation,
		}
	}

	/// Builds a reference from externally supplied DICOM files, one per slice or one
	/// multi-frame instance.
	pub fn from_files(
		files: &[impl AsRef<[u8]>],
		rotation: crate::transcode::Rotation,
	) -> Result<Self, AssemblyError> {
		let mut series = None;
		let mut frame_of_reference = None;
		let mut instances = Vec::with_capacity(files.len());

		for bytes in files {
			let object = reidentify::parse(bytes.as_ref())?;
			let uid = |tag, attribute| {
				text(&object, tag)
					.and_then(|value| Uid::new(value).ok())
					.ok_or(AssemblyError::MissingAttribute { attribute })
			};

			series.get_or_insert(uid(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?);
			frame_of_reference.get_or_insert(uid(
				tags::FRAME_OF_REFERENCE_UID,
				"FrameOfReferenceUID",
			)?);
			let number_of_frames = text(&object, tags::NUMBER_OF_FRAMES)
				.and_then(|value| value.parse().ok())
				.unwrap_or(1);
			let instance_number: i64 = text(&object, tags::INSTANCE_NUMBER)
				.and_then(|value| value.parse().ok())
				.unwrap_or_default();

			instances.push((
				instance_number,
				SourceInstance {
					sop_class_uid: text(&object, tags::SOP_CLASS_UID).ok_or(
						AssemblyError::MissingAttribute {
							attribute: "SOPClassUID",
						},
					)?,
					sop_instance_uid: uid(tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
					number_of_frames,
				},
			));
		}

		instances.sort_by_key(|(number, _)| *number);
		Ok(Self {
			series_instance_uid: series.ok_or(AssemblyError::MissingAttribute {
				attribute: "SeriesInstanceUID",
			})?,
			frame_of_reference_uid: frame_of_reference.ok_or(AssemblyError::MissingAttribute {
				attribute: "FrameOfReferenceUID",
			})?,
			instances: instances.into_iter().map(|(_, instance)| instance).collect(),
			rotation,
		})
	}
}

/// The trimmed string value of `tag`, if present and not empty.
pub(crate) fn text(object: &InMemDicomObject, tag: Tag) -> Option<String> {
	let element = object.element(tag).ok()?;
	let value = element.to_str().ok()?;
	Some(value.trim_matches(['\0', ' ']).to_owned()).filter(|value| !value.is_empty())
}

pub(crate) fn str_element(tag: Tag, vr: VR, value: &str) -> DataElement<InMemDicomObject> {
	DataElement::new(tag, vr, dicom_value!(Str, value))
}

/// A multi-valued string element, such as Image Type.
pub(crate) fn strs_element(tag: Tag, vr: VR, values: &[&str]) -> DataElement<InMemDicomObject> {
	let values = values.iter().map(|value| (*value).to_owned()).collect();
	DataElement::new(tag, vr, PrimitiveValue::Strs(values))
}

pub(crate) fn uid_element(tag: Tag, uid: &Uid) -> DataElement<InMemDicomObject> {
	DataElement::new(tag, VR::UI, PrimitiveValue::from(uid))
}

pub(crate) fn us_element(tag: Tag, value: u16) -> DataElement<InMemDicomObject> {
	DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

/// Image Pixel module attributes for a single-component image, excluding Pixel Data.
pub(crate) fn image_pixel_elements(
	pixels: &PixelBuffer,
) -> Result<Vec<DataElement<InMemDicomObject>>, AssemblyError> {
	let dimension = |value: usize, attribute| {
		u16::try_from(value).map_err(|_| AssemblyError::DimensionTooLarge { attribute, value })
	};
	Ok(vec![
		us_element(tags::SAMPLES_PER_PIXEL, 1),
		str_element(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"),
		us_element(tags::ROWS, dimension(pixels.rows, "Rows")?),
		us_element(tags::COLUMNS, dimension(pixels.columns, "Columns")?),
		us_element(tags::BITS_ALLOCATED, pixels.bits_allocated),
		us_element(tags::BITS_STORED, pixels.bits_stored),
		us_element(tags::HIGH_BIT, pixels.high_bit),
		us_element(tags::PIXEL_REPRESENTATION, pixels.pixel_representation as u16),
	])
}

/// Modality LUT attributes mapping stored values onto real values.
pub(crate) fn rescale_elements(
	pixels: &PixelBuffer,
) -> Result<Vec<DataElement<InMemDicomObject>>, AssemblyError> {
	Ok(vec![
		decimal_strings(tags::RESCALE_INTERCEPT, &[pixels.modality_intercept()])?,
		decimal_strings(tags::RESCALE_SLOPE, &[pixels.rescale_slope])?,
		str_element(tags::RESCALE_TYPE, VR::LO, "US"),
	])
}

pub(crate) fn window_elements(
	pixels: &PixelBuffer,
) -> Result<Vec<DataElement<InMemDicomObject>>, AssemblyError> {
	Ok(vec![
		decimal_strings(tags::WINDOW_CENTER, &[pixels.window.center])?,
		decimal_strings(tags::WINDOW_WIDTH, &[pixels.window.width])?,
	])
}

/// Pixel Data as OB for 8-bit and OW for 16-bit samples.
pub(crate) fn pixel_data_element(
	bits_allocated: u16,
	data: Vec<u8>,
) -> DataElement<InMemDicomObject> {
	let vr = if bits_allocated <= 8 { VR::OB } else { VR::OW };
	DataElement::new(tags::PIXEL_DATA, vr, PrimitiveValue::from(data))
}

/// Checks that a volume produced as many frames as it has slices.
pub(crate) fn check_frames(pixels: &PixelBuffer, slices: usize) -> Result<(), AssemblyError> {
	if pixels.frames == slices {
		Ok(())
	} else {
		Err(AssemblyError::InconsistentFrames {
			frames: pixels.frames,
			slices,
		})
	}
}
