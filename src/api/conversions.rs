use super::{conversion_status, FormError};
use crate::assembly::{PatientIdentity, StudyContext};
use crate::pipeline::staging::Staging;
use crate::pipeline::{
	load_volume, BundleReport, BundleRequest, ConversionError, LabelledVolume, Layout, Pipeline,
	SegmentationRequest, Stage,
};
use crate::types::{parse_da, Sex};
use crate::AppState;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures::future::try_join_all;
use tracing::{info, instrument, warn};

pub fn routes() -> Router<AppState> {
	Router::new().route("/conversions", post(create))
}

struct Upload {
	file_name: String,
	bytes: Bytes,
}

#[derive(Default)]
struct ConversionForm {
	patient: PatientIdentity,
	study_instance_uid: Option<String>,
	layout: Layout,
	modalities: Vec<String>,
	files: Vec<Upload>,
	segmentation: Option<Upload>,
	segmentation_reference: Option<String>,
}

impl ConversionForm {
	async fn read(multipart: &mut Multipart) -> Result<Self, FormError> {
		let mut form = Self::default();
		let (mut patient_id, mut patient_name) = (None, None);

		while let Some(field) = multipart.next_field().await? {
			let name = field.name().unwrap_or_default().to_owned();
			match name.as_str() {
				"files" | "segmentation" => {
					let upload = Upload {
						file_name: field.file_name().unwrap_or_default().to_owned(),
						bytes: field.bytes().await?,
					};
					if name == "files" {
						form.files.push(upload);
					} else {
						form.segmentation = Some(upload);
					}
				}
				"patient_id" => patient_id = Some(field.text().await?),
				"patient_name" => patient_name = Some(field.text().await?),
				"birth_date" => {
					let value = field.text().await?;
					let date = parse_da(value.trim()).map_err(|err| FormError::Invalid {
						field: "birth_date",
						message: err.to_string(),
					})?;
					form.patient.birth_date = Some(date);
				}
				"sex" => {
					let value = field.text().await?;
					let sex = value.parse::<Sex>().map_err(|err| FormError::Invalid {
						field: "sex",
						message: err.to_string(),
					})?;
					form.patient.sex = Some(sex);
				}
				"study_instance_uid" => form.study_instance_uid = Some(field.text().await?),
				"layout" => {
					form.layout = field
						.text()
						.await?
						.parse()
						.map_err(|message| FormError::Invalid {
							field: "layout",
							message,
						})?;
				}
				"modalities" => form.modalities.push(field.text().await?.trim().to_owned()),
				"segmentation_reference" => {
					form.segmentation_reference = Some(field.text().await?.trim().to_owned());
				}
				other => warn!("Ignoring unknown form field {other}"),
			}
		}

		let identity = PatientIdentity::new(
			&patient_id.ok_or(FormError::Missing("patient_id"))?,
			&patient_name.ok_or(FormError::Missing("patient_name"))?,
		);
		form.patient.external_id = identity.external_id;
		form.patient.display_name = identity.display_name;

		if form.files.is_empty() {
			return Err(FormError::Missing("files"));
		}
		if form.files.len() != form.modalities.len() {
			return Err(FormError::Invalid {
				field: "modalities",
				message: format!(
					"{} files were uploaded with {} modality labels",
					form.files.len(),
					form.modalities.len()
				),
			});
		}
		Ok(form)
	}
}

/// Status of a bundle answer. Partial failures are reported inside a 200 body.
fn bundle_status(report: &BundleReport) -> StatusCode {
	if !report.series.is_empty() {
		return StatusCode::OK;
	}
	let archive_failed = report
		.failures
		.iter()
		.any(|failure| matches!(failure.stage, Stage::Store | Stage::Verify));
	if archive_failed {
		StatusCode::BAD_GATEWAY
	} else {
		StatusCode::UNPROCESSABLE_ENTITY
	}
}

#[instrument(skip_all)]
async fn create(State(state): State<AppState>, mut multipart: Multipart) -> Response {
	let form = match ConversionForm::read(&mut multipart).await {
		Ok(form) => form,
		Err(err) => return err.into_response(),
	};

	match convert(&state, form).await {
		Ok(report) => {
			info!(
				study = %report.study_instance_uid,
				series = report.series.len(),
				failures = report.failures.len(),
				"Converted bundle"
			);
			(bundle_status(&report), Json(report)).into_response()
		}
		Err(err) => {
			warn!(status = %conversion_status(&err), "Conversion failed: {err}");
			err.into_response()
		}
	}
}

async fn convert(state: &AppState, form: ConversionForm) -> Result<BundleReport, ConversionError> {
	let config = &state.config;
	let staging = Staging::new(config.conversion.staging_dir.as_deref())
		.map_err(|err| ConversionError::new(Stage::Staging, None, err))?;

	let volumes = try_join_all(form.files.iter().zip(&form.modalities).enumerate().map(
		|(index, (upload, label))| {
			let staging = &staging;
			async move {
				let stem = format!("{index}-{label}");
				let volume = load_volume(staging, &stem, &upload.file_name, &upload.bytes).await?;
				Ok::<_, ConversionError>(LabelledVolume {
					label: label.clone(),
					volume,
				})
			}
		},
	))
	.await?;

	let segmentation = match &form.segmentation {
		Some(upload) => Some(SegmentationRequest {
			mask: load_volume(&staging, "segmentation", &upload.file_name, &upload.bytes).await?,
			reference: form.segmentation_reference.clone(),
		}),
		None => None,
	};

	let request = BundleRequest {
		study: StudyContext::new(
			form.patient,
			form.study_instance_uid.as_deref(),
			config.conversion.identity_policy,
		),
		layout: form.layout,
		volumes,
		segmentation,
	};
	Pipeline::new(state.transport.as_ref(), config)
		.convert_bundle(request)
		.await
}

#[cfg(test)]
mod tests {
	use super::super::tests::{file, multipart_request, send, state, text};
	use super::*;
	use crate::volume::nifti_bytes;
	use serde_json::Value;

	fn volume(slices: usize) -> Vec<u8> {
		let data: Vec<f32> = (0..4 * 4 * slices).map(|v| v as f32).collect();
		nifti_bytes((4, 4, slices), None, &data)
	}

	fn mask(slices: usize) -> Vec<u8> {
		let data: Vec<f32> = (0..4 * 4 * slices).map(|v| (v % 2) as f32).collect();
		nifti_bytes((4, 4, slices), None, &data)
	}

	#[tokio::test]
	async fn converts_a_bundle_with_segmentation() {
		let (state, archive) = state();
		let flair = volume(3);
		let dwi = volume(3);
		let seg = mask(3);
		let request = multipart_request(
			"/api/conversions",
			&[
				text("patient_id", "PID-42"),
				text("patient_name", "Jane Doe"),
				text("birth_date", "19800102"),
				text("sex", "F"),
				text("layout", "classic"),
				text("modalities", "FLAIR"),
				file("files", "flair.nii", &flair),
				text("modalities", "DWI"),
				file("files", "dwi.nii", &dwi),
				file("segmentation", "mask.nii", &seg),
			],
		);

		let (status, body) = send(state, request).await;
		assert_eq!(status, StatusCode::OK);

		let report: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(report["series"].as_array().unwrap().len(), 3);
		assert!(report["failures"].as_array().unwrap().is_empty());
		assert_eq!(report["series"][0]["label"], "FLAIR");
		assert_eq!(report["series"][0]["instances"].as_array().unwrap().len(), 3);
		let image_id = report["series"][2]["instances"][0]["image_id"].as_str().unwrap();
		assert!(image_id.starts_with("wadouri:http://localhost:8080/api/instances/"));
		assert_eq!(archive.len(), 7);
	}

	#[tokio::test]
	async fn files_and_labels_must_pair() {
		let (state, archive) = state();
		let flair = volume(2);
		let request = multipart_request(
			"/api/conversions",
			&[
				text("patient_id", "PID-42"),
				text("patient_name", "Jane Doe"),
				file("files", "flair.nii", &flair),
			],
		);

		let (status, body) = send(state, request).await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert!(String::from_utf8_lossy(&body).contains("modality labels"));
		assert!(archive.is_empty());
	}

	#[tokio::test]
	async fn unreadable_volumes_are_unprocessable() {
		let (state, _) = state();
		let request = multipart_request(
			"/api/conversions",
			&[
				text("patient_id", "PID-42"),
				text("patient_name", "Jane Doe"),
				text("modalities", "FLAIR"),
				file("files", "flair.nii.gz", b"not gzip"),
			],
		);

		let (status, body) = send(state, request).await;
		assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
		let failure: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(failure["stage"], "load");
	}

	#[tokio::test]
	async fn mismatched_segmentations_are_reported_in_the_body() {
		let (state, _) = state();
		let flair = volume(3);
		let seg = mask(2);
		let request = multipart_request(
			"/api/conversions",
			&[
				text("patient_id", "PID-42"),
				text("patient_name", "Jane Doe"),
				text("modalities", "FLAIR"),
				file("files", "flair.nii", &flair),
				file("segmentation", "mask.nii", &seg),
			],
		);

		let (status, body) = send(state, request).await;
		assert_eq!(status, StatusCode::OK);
		let report: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(report["series"].as_array().unwrap().len(), 1);
		assert_eq!(report["failures"][0]["stage"], "assembly");
		assert_eq!(report["failures"][0]["series"], "SEG");
	}
}
