use super::{conversion_status, is_archive_id, transport_status, FormError};
use crate::assembly::PatientIdentity;
use crate::backend::TransportError;
use crate::pipeline::Pipeline;
use crate::AppState;
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use tracing::{error, instrument, warn};

const DICOM_MEDIA_TYPE: &str = "application/dicom";

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/instances", post(upload))
		.route("/instances/{id}/file", get(file))
}

/// Streams a stored instance to a viewer.
#[instrument(skip_all, fields(id = %id))]
async fn file(State(state): State<AppState>, Path(id): Path<String>) -> Response {
	if !is_archive_id(&id) {
		return (StatusCode::BAD_REQUEST, "Invalid instance identifier").into_response();
	}

	match state.transport.retrieve(&id).await {
		Ok(instance) => {
			let mut headers = HeaderMap::new();
			headers.insert(CONTENT_TYPE, HeaderValue::from_static(DICOM_MEDIA_TYPE));
			let disposition = format!(r#"attachment; filename="{id}.dcm""#);
			if let Ok(disposition) = HeaderValue::from_str(&disposition) {
				headers.insert(CONTENT_DISPOSITION, disposition);
			}
			if let Some(length) = instance.content_length {
				headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
			}
			(headers, Body::from_stream(instance.stream)).into_response()
		}
		Err(TransportError::RetrieveFailed { status, body }) => {
			warn!(%status, "Archive refused to serve instance");
			(status, body).into_response()
		}
		Err(err) => {
			error!("Failed to retrieve instance: {err}");
			(transport_status(&err), err.to_string()).into_response()
		}
	}
}

struct UploadForm {
	file: Bytes,
	patient: PatientIdentity,
}

impl UploadForm {
	async fn read(multipart: &mut Multipart) -> Result<Self, FormError> {
		let (mut file, mut patient_id, mut patient_name) = (None, None, None);
		while let Some(field) = multipart.next_field().await? {
			let name = field.name().unwrap_or_default().to_owned();
			match name.as_str() {
				"file" => file = Some(field.bytes().await?),
				"patient_id" => patient_id = Some(field.text().await?),
				"patient_name" => patient_name = Some(field.text().await?),
				other => warn!("Ignoring unknown form field {other}"),
			}
		}

		Ok(Self {
			file: file.ok_or(FormError::Missing("file"))?,
			patient: PatientIdentity::new(
				&patient_id.ok_or(FormError::Missing("patient_id"))?,
				&patient_name.ok_or(FormError::Missing("patient_name"))?,
			),
		})
	}
}

/// Stores an existing DICOM file under the given patient.
#[instrument(skip_all)]
async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
	let form = match UploadForm::read(&mut multipart).await {
		Ok(form) => form,
		Err(err) => return err.into_response(),
	};

	let pipeline = Pipeline::new(state.transport.as_ref(), &state.config);
	match pipeline
		.upload_instance(form.file, &form.patient, state.config.conversion.identity_policy)
		.await
	{
		Ok(report) => Json(report).into_response(),
		Err(err) => {
			warn!(status = %conversion_status(&err), "Upload failed: {err}");
			err.into_response()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::super::tests::{file, multipart_request, send, state, text};
	use super::*;
	use crate::assembly::classic::ClassicAssembler;
	use crate::assembly::tests::study;
	use crate::assembly::SeriesSpec;
	use crate::backend::PacsTransport;
	use crate::geometry;
	use crate::transcode::{to_continuous, Rotation};
	use crate::volume::{Affine, Volume};
	use axum::http::Request;
	use ndarray::Array3;
	use serde_json::Value;
	use tower::ServiceExt;

	fn instance() -> Bytes {
		let volume = Volume::new(
			Array3::from_shape_fn((2, 2, 1), |(x, y, _)| (x * 2 + y) as f32),
			Affine::from_scale(1.0, 1.0, 1.0),
		);
		let geometry = geometry::resolve(volume.affine(), 1).unwrap();
		let pixels = to_continuous(volume.samples(), 16, Rotation::None, None).unwrap();
		ClassicAssembler::new(&study(), &SeriesSpec::new("MR", 1, None), &geometry, &pixels)
			.unwrap()
			.instance(0)
			.unwrap()
			.bytes()
	}

	#[tokio::test]
	async fn stored_files_are_streamed_back() {
		let (state, archive) = state();
		let bytes = instance();
		let stored = archive.store(bytes.clone()).await.unwrap();

		let response = super::super::routes("/")
			.with_state(state)
			.oneshot(
				Request::get(format!("/api/instances/{}/file", stored.id))
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();

		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(response.headers()[CONTENT_TYPE], DICOM_MEDIA_TYPE);
		assert_eq!(
			response.headers()[CONTENT_DISPOSITION],
			format!(r#"attachment; filename="{}.dcm""#, stored.id).as_str()
		);
		let body = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		assert_eq!(body, bytes);
	}

	#[tokio::test]
	async fn archive_errors_are_propagated() {
		let (state, _) = state();
		let request = Request::get("/api/instances/0000-ffff/file")
			.body(Body::empty())
			.unwrap();
		let (status, body) = send(state, request).await;
		assert_eq!(status, StatusCode::NOT_FOUND);
		assert_eq!(body, "Unknown instance 0000-ffff");
	}

	#[tokio::test]
	async fn identifiers_are_validated() {
		let (state, _) = state();
		let request = Request::get("/api/instances/not-an-id!/file")
			.body(Body::empty())
			.unwrap();
		let (status, _) = send(state, request).await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn uploads_are_stored_under_the_new_patient() {
		let (state, archive) = state();
		let bytes = instance();
		let request = multipart_request(
			"/api/instances",
			&[
				text("patient_id", "NEW-1"),
				text("patient_name", "Max Mustermann"),
				file("file", "scan.dcm", &bytes),
			],
		);

		let (status, body) = send(state, request).await;
		assert_eq!(status, StatusCode::OK);
		let report: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(report["instances"].as_array().unwrap().len(), 1);
		assert_eq!(archive.find_patient("NEW-1").await.unwrap(), ["NEW-1"]);
	}

	#[tokio::test]
	async fn uploads_must_be_dicom() {
		let (state, archive) = state();
		let request = multipart_request(
			"/api/instances",
			&[
				text("patient_id", "NEW-1"),
				text("patient_name", "Max"),
				file("file", "notes.txt", b"hello"),
			],
		);

		let (status, body) = send(state, request).await;
		assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
		let failure: Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(failure["stage"], "assembly");
		assert!(archive.is_empty());
	}
}
