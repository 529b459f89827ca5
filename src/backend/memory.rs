use super::{
	InstanceStream, PacsTransport, SeriesSummary, StoredInstance, StudySummary, TransportError,
};
use crate::assembly::{reidentify::parse, text};
use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use dicom::dictionary_std::tags;
use futures::StreamExt;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

struct Entry {
	id: String,
	bytes: Bytes,
	/// Absent when the patient index skipped the instance.
	patient_id: Option<String>,
	study: Option<StudySummary>,
	series: Option<SeriesSummary>,
}

/// Archive kept in process memory.
/// Used for local runs and tests where no Orthanc server is available.
#[derive(Default)]
pub struct MemoryArchive {
	instances: Mutex<Vec<Entry>>,
	/// Stores instances without adding them to the patient index.
	unindexed: bool,
}

/// Study and series identifiers are derived from their UIDs, so repeated stores land in the
/// same study and series.
fn resource_id(uid: &str) -> String {
	Uuid::new_v5(&Uuid::NAMESPACE_OID, uid.as_bytes()).to_string()
}

impl MemoryArchive {
	#[cfg(test)]
	pub(crate) fn unindexed() -> Self {
		Self {
			unindexed: true,
			..Self::default()
		}
	}

	pub fn len(&self) -> usize {
		self.instances.lock().map_or(0, |instances| instances.len())
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

fn poisoned() -> TransportError {
	TransportError::InvalidResponse {
		source: "In-memory archive lock is poisoned".into(),
	}
}

#[async_trait]
impl PacsTransport for MemoryArchive {
	async fn store(&self, instance: Bytes) -> Result<StoredInstance, TransportError> {
		let object = parse(&instance).map_err(|err| TransportError::StoreFailed {
			status: Some(StatusCode::BAD_REQUEST),
			message: err.to_string(),
		})?;
		let patient_id = text(&object, tags::PATIENT_ID).filter(|_| !self.unindexed);
		let study = text(&object, tags::STUDY_INSTANCE_UID).map(|uid| StudySummary {
			id: resource_id(&uid),
			study_instance_uid: Some(uid),
			study_date: text(&object, tags::STUDY_DATE),
			study_description: text(&object, tags::STUDY_DESCRIPTION),
			series: Vec::new(),
		});
		let series = text(&object, tags::SERIES_INSTANCE_UID).map(|uid| SeriesSummary {
			id: resource_id(&uid),
			series_instance_uid: Some(uid),
			series_number: text(&object, tags::SERIES_NUMBER),
			series_description: text(&object, tags::SERIES_DESCRIPTION),
			modality: text(&object, tags::MODALITY),
			instances: Vec::new(),
		});
		let parent_series = series.as_ref().map(|series| series.id.clone());

		let id = Uuid::new_v4().to_string();
		self.instances.lock().map_err(|_| poisoned())?.push(Entry {
			id: id.clone(),
			bytes: instance,
			patient_id,
			study,
			series,
		});
		debug!(%id, "Stored instance in memory");

		Ok(StoredInstance {
			id,
			status: Some("Success".to_owned()),
			parent_series,
		})
	}

	async fn retrieve(&self, id: &str) -> Result<InstanceStream, TransportError> {
		let bytes = self
			.instances
			.lock()
			.map_err(|_| poisoned())?
			.iter()
			.find(|entry| entry.id == id)
			.map(|entry| entry.bytes.clone())
			.ok_or_else(|| TransportError::RetrieveFailed {
				status: StatusCode::NOT_FOUND,
				body: Bytes::from(format!("Unknown instance {id}")),
			})?;

		Ok(InstanceStream {
			content_length: Some(bytes.len() as u64),
			stream: futures::stream::once(async move { Ok(bytes) }).boxed(),
		})
	}

	async fn find_patient(&self, patient_id: &str) -> Result<Vec<String>, TransportError> {
		let indexed = self
			.instances
			.lock()
			.map_err(|_| poisoned())?
			.iter()
			.any(|entry| entry.patient_id.as_deref() == Some(patient_id));

		Ok(if indexed {
			vec![patient_id.to_owned()]
		} else {
			Vec::new()
		})
	}

	async fn find_studies(&self, patient_id: &str) -> Result<Vec<StudySummary>, TransportError> {
		let instances = self.instances.lock().map_err(|_| poisoned())?;
		let mut studies: Vec<StudySummary> = Vec::new();

		let indexed = instances
			.iter()
			.filter(|entry| entry.patient_id.as_deref() == Some(patient_id));
		for entry in indexed {
			let (Some(study), Some(series)) = (&entry.study, &entry.series) else {
				continue;
			};

			let position = studies.iter().position(|known| known.id == study.id);
			let study = match position {
				Some(position) => &mut studies[position],
				None => {
					studies.push(study.clone());
					let last = studies.len() - 1;
					&mut studies[last]
				}
			};

			let position = study.series.iter().position(|known| known.id == series.id);
			let series = match position {
				Some(position) => &mut study.series[position],
				None => {
					study.series.push(series.clone());
					let last = study.series.len() - 1;
					&mut study.series[last]
				}
			};
			series.instances.push(entry.id.clone());
		}

		Ok(studies)
	}

	async fn series_instances(&self, series_id: &str) -> Result<Vec<String>, TransportError> {
		let instances: Vec<String> = self
			.instances
			.lock()
			.map_err(|_| poisoned())?
			.iter()
			.filter(|entry| {
				entry
					.series
					.as_ref()
					.is_some_and(|series| series.id == series_id)
			})
			.map(|entry| entry.id.clone())
			.collect();

		if instances.is_empty() {
			return Err(TransportError::RetrieveFailed {
				status: StatusCode::NOT_FOUND,
				body: Bytes::from(format!("Unknown series {series_id}")),
			});
		}
		Ok(instances)
	}

	async fn ping(&self) -> Result<(), TransportError> {
		Ok(())
	}
}
