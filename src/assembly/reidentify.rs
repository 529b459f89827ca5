//! Rebuilds existing DICOM files under a new patient identity.

use super::{
	str_element, text, uid_element, AssemblyError, DicomInstance, IdentityPolicy,
	PatientIdentity, StudyContext,
};
use crate::types::{da, tm, Uid};
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::{DefaultDicomObject, InMemDicomObject};
use tracing::{debug, instrument};

const PREAMBLE_LENGTH: usize = 128;
const MAGIC: &[u8] = b"DICM";

/// Parses a DICOM file with or without its 128 byte preamble.
pub(crate) fn parse(bytes: &[u8]) -> Result<DefaultDicomObject, AssemblyError> {
	let body = if bytes.get(PREAMBLE_LENGTH..PREAMBLE_LENGTH + MAGIC.len()) == Some(MAGIC) {
		&bytes[PREAMBLE_LENGTH..]
	} else if bytes.starts_with(MAGIC) {
		bytes
	} else {
		return Err(AssemblyError::Parse {
			source: "Input is not a DICOM file".into(),
		});
	};

	dicom::object::from_reader(body).map_err(|err| AssemblyError::Parse {
		source: Box::new(err),
	})
}

/// Rebuilds `bytes` into a new instance carrying `patient`.
///
/// The instance gets a new SOP Instance UID. Study and Series Instance UIDs are kept unless
/// they are not valid UIDs, in which case they are regenerated. Missing study date, study
/// time and modality receive defaults. The source transfer syntax is kept.
#[instrument(skip_all)]
pub fn reidentify(
	bytes: &[u8],
	patient: &PatientIdentity,
	policy: IdentityPolicy,
) -> Result<DicomInstance, AssemblyError> {
	let source = parse(bytes)?;
	let transfer_syntax = source.meta().transfer_syntax().to_owned();
	let identity = StudyContext::new(patient.clone(), None, policy);

	let sop_class_uid = text(&source, tags::SOP_CLASS_UID)
		.or_else(|| {
			let class = source.meta().media_storage_sop_class_uid();
			Some(class.trim_end_matches('\0').to_owned()).filter(|class| !class.is_empty())
		})
		.ok_or(AssemblyError::MissingAttribute {
			attribute: "SOPClassUID",
		})?;
	let study_instance_uid =
		Uid::or_generate(text(&source, tags::STUDY_INSTANCE_UID).as_deref());
	let series_instance_uid =
		Uid::or_generate(text(&source, tags::SERIES_INSTANCE_UID).as_deref());
	let instance_number = text(&source, tags::INSTANCE_NUMBER)
		.and_then(|value| value.parse().ok())
		.unwrap_or(1);
	let number_of_frames = text(&source, tags::NUMBER_OF_FRAMES)
		.and_then(|value| value.parse().ok())
		.unwrap_or(1);
	let missing = |tag| text(&source, tag).is_none();
	let (missing_date, missing_time, missing_modality) = (
		missing(tags::STUDY_DATE),
		missing(tags::STUDY_TIME),
		missing(tags::MODALITY),
	);

	let mut dataset: InMemDicomObject = source.into_inner();
	// Strings were decoded on read and are written back as UTF-8
	dataset.put(str_element(tags::SPECIFIC_CHARACTER_SET, VR::CS, "ISO_IR 192"));
	dataset.put(str_element(tags::PATIENT_ID, VR::LO, identity.patient_id()?));
	dataset.put(str_element(
		tags::PATIENT_NAME,
		VR::PN,
		identity.patient_name()?.as_str(),
	));
	dataset.put(uid_element(tags::STUDY_INSTANCE_UID, &study_instance_uid));
	dataset.put(uid_element(tags::SERIES_INSTANCE_UID, &series_instance_uid));
	if missing_date {
		dataset.put(str_element(
			tags::STUDY_DATE,
			VR::DA,
			&da(identity.created.date()),
		));
	}
	if missing_time {
		dataset.put(str_element(tags::STUDY_TIME, VR::TM, &tm(identity.created)));
	}
	if missing_modality {
		dataset.put(str_element(tags::MODALITY, VR::CS, "OT"));
	}

	debug!(
		sop_class = %sop_class_uid,
		transfer_syntax = %transfer_syntax,
		"Rebuilding instance with new identity"
	);
	DicomInstance::encode_as(
		dataset,
		transfer_syntax.trim_end_matches('\0'),
		&sop_class_uid,
		Uid::generate(),
		series_instance_uid,
		instance_number,
		number_of_frames,
	)
}
