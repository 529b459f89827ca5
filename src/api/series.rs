use super::{is_archive_id, transport_status};
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{instrument, warn};

pub fn routes() -> Router<AppState> {
	Router::new().route("/series/{id}/image-ids", get(image_ids))
}

/// Viewer image ids of every instance in a stored series, in archive order.
#[instrument(skip_all, fields(series = %series_id))]
async fn image_ids(State(state): State<AppState>, Path(series_id): Path<String>) -> Response {
	if !is_archive_id(&series_id) {
		return (StatusCode::BAD_REQUEST, "Invalid series identifier").into_response();
	}

	match state.transport.series_instances(&series_id).await {
		Ok(instances) if instances.is_empty() => {
			(StatusCode::NOT_FOUND, "Series has no instances").into_response()
		}
		Ok(instances) => {
			let http = &state.config.server.http;
			let image_ids: Vec<String> = instances.iter().map(|id| http.image_id(id)).collect();
			Json(image_ids).into_response()
		}
		Err(err) => {
			warn!("Series lookup failed: {err}");
			(transport_status(&err), err.to_string()).into_response()
		}
	}
}
