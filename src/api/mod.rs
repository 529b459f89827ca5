use crate::backend::TransportError;
use crate::pipeline::{Cause, ConversionError, UnitFailure};
use crate::AppState;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use thiserror::Error;

mod conversions;
mod home;
mod instances;
mod patients;
mod series;

pub fn routes(base_path: &str) -> Router<AppState> {
	let router = Router::new().merge(home::routes()).nest(
		"/api",
		Router::new()
			.route("/health", get(home::health))
			.merge(conversions::routes())
			.merge(instances::routes())
			.merge(patients::routes())
			.merge(series::routes()),
	);

	// axum no longer supports nesting at the root
	match base_path {
		"/" | "" => router,
		base_path => Router::new().nest(base_path, router),
	}
}

/// Status code a failed archive call is answered with. The archive's own status is passed
/// through where there is one.
pub fn transport_status(err: &TransportError) -> StatusCode {
	match err {
		TransportError::StoreFailed {
			status: Some(status),
			..
		}
		| TransportError::RetrieveFailed { status, .. } => *status,
		TransportError::StoreFailed { status: None, .. }
		| TransportError::IdentityIndexMismatch { .. }
		| TransportError::InvalidResponse { .. } => StatusCode::BAD_GATEWAY,
		TransportError::Unreachable { .. } => StatusCode::GATEWAY_TIMEOUT,
	}
}

pub fn conversion_status(err: &ConversionError) -> StatusCode {
	match &err.cause {
		Cause::Request(_) => StatusCode::BAD_REQUEST,
		Cause::Io(io) if io.kind() == std::io::ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
		Cause::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
		Cause::Volume(_) | Cause::Geometry(_) | Cause::Transcode(_) => {
			StatusCode::UNPROCESSABLE_ENTITY
		}
		Cause::Assembly(crate::assembly::AssemblyError::Encode { .. }) => {
			StatusCode::INTERNAL_SERVER_ERROR
		}
		Cause::Assembly(_) => StatusCode::UNPROCESSABLE_ENTITY,
		Cause::Transport(err) => transport_status(err),
	}
}

impl IntoResponse for ConversionError {
	fn into_response(self) -> Response {
		(conversion_status(&self), Json(UnitFailure::new(None, &self))).into_response()
	}
}

/// A multipart form that could not be read or is incomplete.
#[derive(Debug, Error)]
pub enum FormError {
	#[error(transparent)]
	Multipart(#[from] MultipartError),
	#[error("Missing form field {0}")]
	Missing(&'static str),
	#[error("Invalid form field {field}: {message}")]
	Invalid { field: &'static str, message: String },
}

impl IntoResponse for FormError {
	fn into_response(self) -> Response {
		let status = match &self {
			Self::Multipart(err) => err.status(),
			Self::Missing(_) | Self::Invalid { .. } => StatusCode::BAD_REQUEST,
		};
		(status, self.to_string()).into_response()
	}
}

/// Archive identifiers consist of hex digits and dashes.
pub fn is_archive_id(id: &str) -> bool {
	!id.is_empty() && id.len() <= 64 && id.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}
