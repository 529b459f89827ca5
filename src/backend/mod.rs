//! Moves encoded instances into and out of a PACS archive.

use crate::config::{PacsBackend, PacsConfig};
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub mod memory;
pub mod orthanc;

#[derive(Debug, Error)]
pub enum TransportError {
	/// The archive refused the instance, or could not be reached to store it.
	/// `status` is absent when no response was received.
	#[error("Archive rejected the instance: {message}")]
	StoreFailed {
		status: Option<StatusCode>,
		message: String,
	},
	#[error("Archive answered {status}")]
	RetrieveFailed { status: StatusCode, body: Bytes },
	#[error("Stored {stored} instances but patient {patient_id} is not indexed by the archive")]
	IdentityIndexMismatch { patient_id: String, stored: usize },
	#[error("Archive is unreachable")]
	Unreachable {
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
	#[error("Unexpected archive response")]
	InvalidResponse {
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},
}

/// The archive's answer to a successful store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredInstance {
	/// Archive-assigned instance identifier.
	pub id: String,
	pub status: Option<String>,
	pub parent_series: Option<String>,
}

/// A study held by the archive, together with its series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudySummary {
	/// Archive-assigned study identifier.
	pub id: String,
	pub study_instance_uid: Option<String>,
	pub study_date: Option<String>,
	pub study_description: Option<String>,
	pub series: Vec<SeriesSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesSummary {
	/// Archive-assigned series identifier.
	pub id: String,
	pub series_instance_uid: Option<String>,
	pub series_number: Option<String>,
	pub series_description: Option<String>,
	pub modality: Option<String>,
	/// Archive identifiers of the instances in the series.
	pub instances: Vec<String>,
}

/// Raw instance bytes as they arrive from the archive.
pub struct InstanceStream {
	pub content_length: Option<u64>,
	pub stream: BoxStream<'static, Result<Bytes, TransportError>>,
}

#[async_trait]
pub trait PacsTransport: Send + Sync {
	/// Stores one complete encoded instance.
	async fn store(&self, instance: Bytes) -> Result<StoredInstance, TransportError>;

	/// Streams the stored file of instance `id`.
	async fn retrieve(&self, id: &str) -> Result<InstanceStream, TransportError>;

	/// Archive identifiers of the patients indexed under `patient_id`.
	async fn find_patient(&self, patient_id: &str) -> Result<Vec<String>, TransportError>;

	/// Studies of the patient indexed under `patient_id`.
	async fn find_studies(&self, patient_id: &str) -> Result<Vec<StudySummary>, TransportError>;

	/// Archive identifiers of the instances in series `series_id`.
	async fn series_instances(&self, series_id: &str) -> Result<Vec<String>, TransportError>;

	/// Checks that the archive answers.
	async fn ping(&self) -> Result<(), TransportError>;
}

/// Creates the transport selected by the configuration.
pub fn from_config(config: &PacsConfig) -> Result<Arc<dyn PacsTransport>, reqwest::Error> {
	let transport: Arc<dyn PacsTransport> = match config.backend {
		PacsBackend::Orthanc => {
			info!(url = %config.url, "Using Orthanc archive");
			Arc::new(orthanc::OrthancTransport::new(config)?)
		}
		PacsBackend::Memory => {
			info!("Using in-memory archive");
			Arc::new(memory::MemoryArchive::default())
		}
	};
	Ok(transport)
}
