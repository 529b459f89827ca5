//! Orthanc REST API client.

use super::{
	InstanceStream, PacsTransport, SeriesSummary, StoredInstance, StudySummary, TransportError,
};
use crate::config::PacsConfig;
use async_trait::async_trait;
use axum::http::header::CONTENT_TYPE;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::error::Error as _;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

const DICOM_MEDIA_TYPE: &str = "application/dicom";

#[derive(Debug, Deserialize)]
struct StoreResponse {
	#[serde(rename = "ID")]
	id: String,
	#[serde(rename = "Status")]
	status: Option<String>,
	#[serde(rename = "ParentSeries")]
	parent_series: Option<String>,
}

/// A patient, study, series or instance as listed by the REST API.
#[derive(Debug, Deserialize)]
struct Resource {
	#[serde(rename = "ID")]
	id: String,
	#[serde(rename = "MainDicomTags", default)]
	tags: HashMap<String, String>,
	#[serde(rename = "Instances", default)]
	instances: Vec<String>,
}

impl From<Resource> for SeriesSummary {
	fn from(mut series: Resource) -> Self {
		Self {
			id: series.id,
			series_instance_uid: series.tags.remove("SeriesInstanceUID"),
			series_number: series.tags.remove("SeriesNumber"),
			series_description: series.tags.remove("SeriesDescription"),
			modality: series.tags.remove("Modality"),
			instances: series.instances,
		}
	}
}

pub struct OrthancTransport {
	client: Client,
	base: Url,
	username: Option<String>,
	password: Option<String>,
}

impl OrthancTransport {
	pub fn new(config: &PacsConfig) -> Result<Self, reqwest::Error> {
		let client = Client::builder()
			.timeout(Duration::from_millis(config.timeout))
			.connect_timeout(Duration::from_millis(config.connect_timeout))
			.user_agent(concat!("vol2dcm/", env!("CARGO_PKG_VERSION")))
			.build()?;

		Ok(Self {
			client,
			base: config.url.clone(),
			username: config.username.clone(),
			password: config.password.clone(),
		})
	}

	fn endpoint(&self, path: &str) -> String {
		format!("{}{path}", self.base.as_str().trim_end_matches('/'))
	}

	fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
		match &self.username {
			Some(username) => request.basic_auth(username, self.password.as_ref()),
			None => request,
		}
	}

	/// Sends a request, repeating it once if the first attempt failed in transit.
	/// Responses are never retried, whatever their status.
	async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, reqwest::Error> {
		match self.authorize(build()).send().await {
			Err(err) if is_transient(&err) => {
				warn!("Archive request failed, retrying once: {err}");
				self.authorize(build()).send().await
			}
			result => result,
		}
	}

	async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
		let url = self.endpoint(path);
		let response = self
			.send(|| self.client.get(&url))
			.await
			.map_err(unreachable)?;
		decode(response).await
	}

	/// Archive identifiers of the resources at `level` belonging to `patient_id`.
	async fn find(&self, level: &str, patient_id: &str) -> Result<Vec<String>, TransportError> {
		let url = self.endpoint("/tools/find");
		let query = json!({ "Level": level, "Query": { "PatientID": patient_id } });
		let response = self
			.send(|| self.client.post(&url).json(&query))
			.await
			.map_err(unreachable)?;
		decode(response).await
	}

	async fn study(&self, id: &str) -> Result<StudySummary, TransportError> {
		let mut study: Resource = self.get_json(&format!("/studies/{id}")).await?;
		let series: Vec<Resource> = self.get_json(&format!("/studies/{id}/series")).await?;

		Ok(StudySummary {
			id: study.id,
			study_instance_uid: study.tags.remove("StudyInstanceUID"),
			study_date: study.tags.remove("StudyDate"),
			study_description: study.tags.remove("StudyDescription"),
			series: series.into_iter().map(SeriesSummary::from).collect(),
		})
	}
}

/// Decodes a successful JSON answer. Other statuses become [`TransportError::RetrieveFailed`].
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
	let status = response.status();
	if !status.is_success() {
		let body = response.bytes().await.unwrap_or_default();
		return Err(TransportError::RetrieveFailed { status, body });
	}

	response
		.json()
		.await
		.map_err(|err| TransportError::InvalidResponse {
			source: Box::new(err),
		})
}

/// Timeouts, refused connections and connections the archive dropped before answering.
fn is_transient(err: &reqwest::Error) -> bool {
	if err.is_timeout() || err.is_connect() {
		return true;
	}
	if err.is_status() || !err.is_request() {
		return false;
	}

	let mut cause = err.source();
	while let Some(current) = cause {
		if let Some(io) = current.downcast_ref::<std::io::Error>() {
			if matches!(
				io.kind(),
				ErrorKind::ConnectionReset
					| ErrorKind::ConnectionAborted
					| ErrorKind::BrokenPipe
					| ErrorKind::UnexpectedEof
			) {
				return true;
			}
		}
		if current
			.downcast_ref::<hyper::Error>()
			.is_some_and(hyper::Error::is_incomplete_message)
		{
			return true;
		}
		cause = current.source();
	}
	false
}

fn unreachable(source: reqwest::Error) -> TransportError {
	TransportError::Unreachable {
		source: Box::new(source),
	}
}

#[async_trait]
impl PacsTransport for OrthancTransport {
	#[instrument(skip_all, fields(size = instance.len()))]
	async fn store(&self, instance: Bytes) -> Result<StoredInstance, TransportError> {
		let url = self.endpoint("/instances");
		let response = self
			.send(|| {
				self.client
					.post(&url)
					.header(CONTENT_TYPE, DICOM_MEDIA_TYPE)
					.body(instance.clone())
			})
			.await
			.map_err(|err| TransportError::StoreFailed {
				status: None,
				message: err.to_string(),
			})?;

		let status = response.status();
		if !status.is_success() {
			let message = response.text().await.unwrap_or_default();
			warn!(%status, "Archive rejected instance: {message}");
			return Err(TransportError::StoreFailed {
				status: Some(status),
				message,
			});
		}

		let stored: StoreResponse =
			response
				.json()
				.await
				.map_err(|err| TransportError::InvalidResponse {
					source: Box::new(err),
				})?;
		if stored.id.is_empty() {
			return Err(TransportError::StoreFailed {
				status: Some(status),
				message: "Archive did not assign an instance identifier".to_owned(),
			});
		}

		debug!(id = %stored.id, status = ?stored.status, "Stored instance");
		Ok(StoredInstance {
			id: stored.id,
			status: stored.status,
			parent_series: stored.parent_series,
		})
	}

	#[instrument(skip(self))]
	async fn retrieve(&self, id: &str) -> Result<InstanceStream, TransportError> {
		let url = self.endpoint(&format!("/instances/{id}/file"));
		let response = self
			.send(|| self.client.get(&url))
			.await
			.map_err(unreachable)?;

		let status = response.status();
		if !status.is_success() {
			let body = response.bytes().await.unwrap_or_default();
			return Err(TransportError::RetrieveFailed { status, body });
		}

		Ok(InstanceStream {
			content_length: response.content_length(),
			stream: response.bytes_stream().map_err(unreachable).boxed(),
		})
	}

	#[instrument(skip(self))]
	async fn find_patient(&self, patient_id: &str) -> Result<Vec<String>, TransportError> {
		self.find("Patient", patient_id).await
	}

	#[instrument(skip(self))]
	async fn find_studies(&self, patient_id: &str) -> Result<Vec<StudySummary>, TransportError> {
		let mut studies = Vec::new();
		for id in self.find("Study", patient_id).await? {
			match self.study(&id).await {
				Ok(study) => studies.push(study),
				// Deleted between the lookup and the fetch
				Err(TransportError::RetrieveFailed { status, .. }) => {
					warn!(study = %id, %status, "Skipping study the archive no longer serves");
				}
				Err(err) => return Err(err),
			}
		}
		debug!(count = studies.len(), "Listed studies");
		Ok(studies)
	}

	#[instrument(skip(self))]
	async fn series_instances(&self, series_id: &str) -> Result<Vec<String>, TransportError> {
		let instances: Vec<Resource> = self
			.get_json(&format!("/series/{series_id}/instances"))
			.await?;
		Ok(instances.into_iter().map(|instance| instance.id).collect())
	}

	async fn ping(&self) -> Result<(), TransportError> {
		let url = self.endpoint("/system");
		let response = self
			.send(|| self.client.get(&url))
			.await
			.map_err(unreachable)?;

		let status = response.status();
		if status.is_success() {
			Ok(())
		} else {
			let body = response.bytes().await.unwrap_or_default();
			Err(TransportError::RetrieveFailed { status, body })
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::PacsBackend;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use wiremock::matchers::{basic_auth, body_bytes, body_json, header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn config(server: &MockServer) -> PacsConfig {
		config_for_uri(&server.uri())
	}

	fn config_for_uri(uri: &str) -> PacsConfig {
		PacsConfig {
			backend: PacsBackend::Orthanc,
			url: Url::parse(uri).unwrap(),
			username: Some("orthanc".to_owned()),
			password: Some("secret".to_owned()),
			timeout: 300,
			connect_timeout: 300,
			concurrency: 4,
		}
	}

	fn stored() -> ResponseTemplate {
		ResponseTemplate::new(200).set_body_json(json!({
			"ID": "8b6ad2c5-1e2f8b1a-3c4d5e6f-7a8b9c0d-1e2f3a4b",
			"Path": "/instances/8b6ad2c5-1e2f8b1a-3c4d5e6f-7a8b9c0d-1e2f3a4b",
			"Status": "Success",
			"ParentSeries": "series-1",
		}))
	}

	#[tokio::test]
	async fn store_returns_the_instance_id() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/instances"))
			.and(header("Content-Type", DICOM_MEDIA_TYPE))
			.and(basic_auth("orthanc", "secret"))
			.and(body_bytes(b"DICM-bytes".to_vec()))
			.respond_with(stored())
			.expect(1)
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		let stored = transport
			.store(Bytes::from_static(b"DICM-bytes"))
			.await
			.unwrap();

		assert_eq!(stored.id, "8b6ad2c5-1e2f8b1a-3c4d5e6f-7a8b9c0d-1e2f3a4b");
		assert_eq!(stored.status.as_deref(), Some("Success"));
		assert_eq!(stored.parent_series.as_deref(), Some("series-1"));
	}

	#[tokio::test]
	async fn rejections_are_surfaced_and_not_retried() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/instances"))
			.respond_with(ResponseTemplate::new(400).set_body_string("Bad file format"))
			.expect(1)
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		let err = transport.store(Bytes::from_static(b"junk")).await.unwrap_err();

		match err {
			TransportError::StoreFailed { status, message } => {
				assert_eq!(status, Some(reqwest::StatusCode::BAD_REQUEST));
				assert_eq!(message, "Bad file format");
			}
			other => panic!("unexpected error {other:?}"),
		}
	}

	#[tokio::test]
	async fn timeouts_are_retried_once() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/instances"))
			.respond_with(stored().set_delay(Duration::from_secs(2)))
			.up_to_n_times(1)
			.with_priority(1)
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/instances"))
			.respond_with(stored())
			.expect(1)
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		let stored = transport.store(Bytes::from_static(b"DICM")).await.unwrap();
		assert!(!stored.id.is_empty());
	}

	#[tokio::test]
	async fn second_timeout_fails_the_store() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/instances"))
			.respond_with(stored().set_delay(Duration::from_secs(2)))
			.expect(2)
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		let err = transport.store(Bytes::from_static(b"DICM")).await.unwrap_err();
		assert!(matches!(err, TransportError::StoreFailed { status: None, .. }));
	}

	#[tokio::test]
	async fn dropped_connections_are_retried_once() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();
		let server = tokio::spawn(async move {
			let (first, _) = listener.accept().await.unwrap();
			drop(first);

			let (mut second, _) = listener.accept().await.unwrap();
			let mut request = Vec::new();
			let mut buffer = [0u8; 1024];
			while !request.ends_with(b"\r\n\r\nDICM") {
				let read = second.read(&mut buffer).await.unwrap();
				assert!(read > 0, "connection closed before the request arrived");
				request.extend_from_slice(&buffer[..read]);
			}
			let body = r#"{"ID":"abc-1"}"#;
			let response = format!(
				"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
				body.len()
			);
			second.write_all(response.as_bytes()).await.unwrap();
			second.shutdown().await.unwrap();
		});

		let mut config = config_for_uri(&format!("http://{address}/"));
		config.timeout = 2000;
		let transport = OrthancTransport::new(&config).unwrap();
		let stored = transport.store(Bytes::from_static(b"DICM")).await.unwrap();

		assert_eq!(stored.id, "abc-1");
		assert_eq!(stored.status, None);
		server.await.unwrap();
	}

	#[tokio::test]
	async fn retrieve_streams_the_file() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/instances/abc-123/file"))
			.respond_with(
				ResponseTemplate::new(200).set_body_raw(b"DICM payload".to_vec(), DICOM_MEDIA_TYPE),
			)
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		let response = transport.retrieve("abc-123").await.unwrap();
		assert_eq!(response.content_length, Some(12));

		let chunks: Vec<Bytes> = response.stream.try_collect().await.unwrap();
		assert_eq!(chunks.concat(), b"DICM payload");
	}

	#[tokio::test]
	async fn retrieve_preserves_archive_errors() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/instances/missing/file"))
			.respond_with(ResponseTemplate::new(404).set_body_string("Unknown resource"))
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		let Err(TransportError::RetrieveFailed { status, body }) =
			transport.retrieve("missing").await
		else {
			panic!("expected a retrieve failure");
		};
		assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
		assert_eq!(body, Bytes::from_static(b"Unknown resource"));
	}

	#[tokio::test]
	async fn find_patient_queries_by_patient_id() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/tools/find"))
			.and(body_json(json!({ "Level": "Patient", "Query": { "PatientID": "PID-42" } })))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!(["patient-a"])))
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		assert_eq!(transport.find_patient("PID-42").await.unwrap(), ["patient-a"]);
	}

	#[tokio::test]
	async fn studies_are_listed_with_their_series() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/tools/find"))
			.and(body_json(json!({ "Level": "Study", "Query": { "PatientID": "PID-42" } })))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!(["study-1", "study-gone"])))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/studies/study-1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"ID": "study-1",
				"Type": "Study",
				"MainDicomTags": {
					"StudyInstanceUID": "2.25.1",
					"StudyDate": "20240105",
					"StudyDescription": "Brain MRI",
				},
				"Series": ["series-1"],
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/studies/study-1/series"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!([{
				"ID": "series-1",
				"Type": "Series",
				"MainDicomTags": {
					"SeriesInstanceUID": "2.25.2",
					"SeriesNumber": "1",
					"SeriesDescription": "FLAIR",
					"Modality": "MR",
				},
				"Instances": ["instance-1", "instance-2"],
			}])))
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		let studies = transport.find_studies("PID-42").await.unwrap();

		assert_eq!(
			studies,
			[StudySummary {
				id: "study-1".to_owned(),
				study_instance_uid: Some("2.25.1".to_owned()),
				study_date: Some("20240105".to_owned()),
				study_description: Some("Brain MRI".to_owned()),
				series: vec![SeriesSummary {
					id: "series-1".to_owned(),
					series_instance_uid: Some("2.25.2".to_owned()),
					series_number: Some("1".to_owned()),
					series_description: Some("FLAIR".to_owned()),
					modality: Some("MR".to_owned()),
					instances: vec!["instance-1".to_owned(), "instance-2".to_owned()],
				}],
			}]
		);
	}

	#[tokio::test]
	async fn series_instances_are_listed_in_archive_order() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/series/series-1/instances"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!([
				{ "ID": "instance-2", "Type": "Instance", "MainDicomTags": { "InstanceNumber": "2" } },
				{ "ID": "instance-1", "Type": "Instance", "MainDicomTags": { "InstanceNumber": "1" } },
			])))
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		assert_eq!(
			transport.series_instances("series-1").await.unwrap(),
			["instance-2", "instance-1"]
		);

		let Err(TransportError::RetrieveFailed { status, .. }) =
			transport.series_instances("series-9").await
		else {
			panic!("expected a retrieve failure");
		};
		assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn ping_checks_the_system_endpoint() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/system"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Version": "1.12.4" })))
			.mount(&server)
			.await;

		let transport = OrthancTransport::new(&config(&server)).unwrap();
		assert!(transport.ping().await.is_ok());
	}
}
