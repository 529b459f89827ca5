use super::transport_status;
use crate::backend::StudySummary;
use crate::AppState;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::{instrument, warn};

pub fn routes() -> Router<AppState> {
	Router::new()
		.route("/patients/{id}/verify", get(verify))
		.route("/patients/{id}/studies", get(studies))
}

#[derive(Debug, Serialize)]
struct Verification {
	patient_id: String,
	indexed: bool,
	/// Archive-side patient identifiers.
	archive_ids: Vec<String>,
}

/// Reports whether the archive indexes instances under the patient id.
#[instrument(skip_all, fields(patient_id = %patient_id))]
async fn verify(State(state): State<AppState>, Path(patient_id): Path<String>) -> Response {
	match state.transport.find_patient(&patient_id).await {
		Ok(archive_ids) => Json(Verification {
			indexed: !archive_ids.is_empty(),
			patient_id,
			archive_ids,
		})
		.into_response(),
		Err(err) => {
			warn!("Patient lookup failed: {err}");
			(transport_status(&err), err.to_string()).into_response()
		}
	}
}

#[derive(Debug, Serialize)]
struct PatientStudies {
	patient_id: String,
	studies: Vec<StudySummary>,
}

/// Lists the patient's studies with their series. Unknown patients have no studies.
#[instrument(skip_all, fields(patient_id = %patient_id))]
async fn studies(State(state): State<AppState>, Path(patient_id): Path<String>) -> Response {
	match state.transport.find_studies(&patient_id).await {
		Ok(studies) => Json(PatientStudies {
			patient_id,
			studies,
		})
		.into_response(),
		Err(err) => {
			warn!("Study lookup failed: {err}");
			(transport_status(&err), err.to_string()).into_response()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::super::tests::{send, state};
	use crate::assembly::classic::ClassicAssembler;
	use crate::assembly::tests::study;
	use crate::assembly::SeriesSpec;
	use crate::backend::PacsTransport;
	use crate::geometry;
	use crate::transcode::{to_binary_mask, Rotation};
	use crate::volume::{Affine, Volume};
	use axum::body::Body;
	use axum::http::{Request, StatusCode};
	use ndarray::Array3;
	use serde_json::{json, Value};

	async fn get_json(state: crate::AppState, uri: &str) -> Value {
		let request = Request::get(uri).body(Body::empty()).unwrap();
		let (status, body) = send(state, request).await;
		assert_eq!(status, StatusCode::OK);
		serde_json::from_slice(&body).unwrap()
	}

	async fn verify(state: crate::AppState, patient_id: &str) -> Value {
		get_json(state, &format!("/api/patients/{patient_id}/verify")).await
	}

	#[tokio::test]
	async fn unknown_patients_are_not_indexed() {
		let (state, _) = state();
		assert_eq!(
			verify(state, "PID-42").await,
			json!({ "patient_id": "PID-42", "indexed": false, "archive_ids": [] })
		);
	}

	#[tokio::test]
	async fn stored_patients_are_indexed() {
		let (state, archive) = state();
		let volume = Volume::new(Array3::ones((2, 2, 1)), Affine::from_scale(1.0, 1.0, 1.0));
		let geometry = geometry::resolve(volume.affine(), 1).unwrap();
		let pixels = to_binary_mask(volume.samples(), 0.5, 255, Rotation::None).unwrap();
		let series = SeriesSpec::new("OT", 1, None);
		let instance = ClassicAssembler::new(&study(), &series, &geometry, &pixels)
			.unwrap()
			.instance(0)
			.unwrap();
		archive.store(instance.bytes()).await.unwrap();

		let verification = verify(state, "PID-42").await;
		assert_eq!(verification["indexed"], true);
		assert_eq!(verification["archive_ids"], json!(["PID-42"]));
	}

	#[tokio::test]
	async fn unknown_patients_have_no_studies() {
		let (state, _) = state();
		assert_eq!(
			get_json(state, "/api/patients/PID-42/studies").await,
			json!({ "patient_id": "PID-42", "studies": [] })
		);
	}

	#[tokio::test]
	async fn studies_list_their_series() {
		let (state, archive) = state();
		let volume = Volume::new(Array3::ones((2, 2, 1)), Affine::from_scale(1.0, 1.0, 1.0));
		let geometry = geometry::resolve(volume.affine(), 1).unwrap();
		let pixels = to_binary_mask(volume.samples(), 0.5, 255, Rotation::None).unwrap();
		let series = SeriesSpec::new("OT", 3, Some("Lesion mask"));
		let instance = ClassicAssembler::new(&study(), &series, &geometry, &pixels)
			.unwrap()
			.instance(0)
			.unwrap();
		let stored = archive.store(instance.bytes()).await.unwrap();

		let listing = get_json(state, "/api/patients/PID-42/studies").await;
		let studies = listing["studies"].as_array().unwrap();
		assert_eq!(studies.len(), 1);
		assert_eq!(
			studies[0]["series"][0]["series_instance_uid"],
			series.series_instance_uid.as_str()
		);
		assert_eq!(studies[0]["series"][0]["series_description"], "Lesion mask");
		assert_eq!(studies[0]["series"][0]["modality"], "OT");
		assert_eq!(studies[0]["series"][0]["instances"], json!([stored.id]));
	}
}
