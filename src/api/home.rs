use super::transport_status;
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::warn;

pub fn routes() -> Router<AppState> {
	Router::new().route("/", get(index))
}

async fn index() -> impl IntoResponse {
	format!("This server is running vol2dcm (v{})", env!("CARGO_PKG_VERSION"))
}

/// Answers 200 when the archive is reachable.
pub(super) async fn health(State(state): State<AppState>) -> Response {
	match state.transport.ping().await {
		Ok(()) => (StatusCode::OK, "OK").into_response(),
		Err(err) => {
			warn!("Archive health check failed: {err}");
			(transport_status(&err), err.to_string()).into_response()
		}
	}
}
