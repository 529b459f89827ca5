use crate::assembly::segmentation::{
	Algorithm, AlgorithmType, SegmentDescription, SegmentationOptions,
};
use crate::assembly::{Equipment, IdentityPolicy};
use crate::transcode::{Rotation, Window};
use crate::types::CodedConcept;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub pacs: PacsConfig,
	pub conversion: ConversionConfig,
	pub segmentation: SegmentationConfig,
}

impl AppConfig {
	/// Loads the compiled-in defaults, then `config.toml` from the working directory, then
	/// environment variables such as `VOL2DCM__PACS__URL`.
	pub fn new() -> Result<Self, ConfigError> {
		Config::builder()
			.add_source(File::from_str(include_str!("defaults.toml"), FileFormat::Toml))
			.add_source(File::with_name("config.toml").required(false))
			.add_source(
				Environment::with_prefix("VOL2DCM")
					.prefix_separator("__")
					.separator("__"),
			)
			.build()?
			.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default log level. `RUST_LOG` takes precedence.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: Level,
	/// Sentry DSN. Sentry stays disabled without one.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
	let value = String::deserialize(deserializer)?;
	Level::from_str(&value).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub http: HttpServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	/// Prefix all routes are nested under.
	pub base_path: String,
	/// Maximum request body size in bytes.
	pub max_upload_size: usize,
	/// Seconds until a request is aborted.
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
	/// Externally visible address of this service, used in viewer image ids.
	pub public_url: String,
}

impl HttpServerConfig {
	/// Viewer image id that loads archive instance `archive_id` through this service.
	pub fn image_id(&self, archive_id: &str) -> String {
		let public_url = self.public_url.trim_end_matches('/');
		format!("wadouri:{public_url}/api/instances/{archive_id}/file")
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacsBackend {
	Orthanc,
	/// Keeps instances in process memory. Nothing survives a restart.
	Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacsConfig {
	pub backend: PacsBackend,
	/// Base URL of the Orthanc REST API.
	pub url: Url,
	pub username: Option<String>,
	pub password: Option<String>,
	/// Request timeout in milliseconds.
	pub timeout: u64,
	/// Connect timeout in milliseconds.
	pub connect_timeout: u64,
	/// Maximum number of concurrent store calls for one series.
	pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversionConfig {
	/// Where uploaded volumes are staged. Defaults to the system temp directory.
	pub staging_dir: Option<PathBuf>,
	pub bit_depth: u16,
	pub classic_rotation: Rotation,
	pub enhanced_rotation: Rotation,
	pub identity_policy: IdentityPolicy,
	/// Maximum number of volumes in one bundle.
	pub max_volumes: usize,
	/// Display windows per modality label, overriding the window derived from the data.
	#[serde(default)]
	pub windows: HashMap<String, Window>,
}

impl ConversionConfig {
	pub fn window(&self, modality: &str) -> Option<Window> {
		self.windows
			.iter()
			.find(|(label, _)| label.eq_ignore_ascii_case(modality))
			.map(|(_, window)| *window)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct SegmentationConfig {
	pub label: String,
	pub category: CodedConcept,
	pub property_type: CodedConcept,
	pub algorithm_type: AlgorithmType,
	pub algorithm_name: String,
	pub algorithm_version: String,
	pub algorithm_family: CodedConcept,
	pub manufacturer: String,
	pub model_name: String,
	pub software_versions: String,
	pub device_serial_number: String,
	pub series_number: u32,
	pub series_description: String,
}

impl From<&SegmentationConfig> for SegmentationOptions {
	fn from(config: &SegmentationConfig) -> Self {
		let algorithm = (config.algorithm_type != AlgorithmType::Manual).then(|| Algorithm {
			name: config.algorithm_name.clone(),
			version: config.algorithm_version.clone(),
			family: config.algorithm_family.clone(),
		});

		Self {
			segments: vec![SegmentDescription {
				label: config.label.clone(),
				category: config.category.clone(),
				property_type: config.property_type.clone(),
				algorithm_type: config.algorithm_type,
				algorithm,
				label_value: None,
			}],
			equipment: Equipment {
				manufacturer: config.manufacturer.clone(),
				model_name: config.model_name.clone(),
				software_versions: config.software_versions.clone(),
				device_serial_number: config.device_serial_number.clone(),
			},
			series_number: config.series_number,
			series_description: config.series_description.clone(),
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;

	pub(crate) fn defaults() -> AppConfig {
		load("")
	}

	fn load(overrides: &str) -> AppConfig {
		Config::builder()
			.add_source(File::from_str(include_str!("defaults.toml"), FileFormat::Toml))
			.add_source(File::from_str(overrides, FileFormat::Toml))
			.build()
			.unwrap()
			.try_deserialize()
			.unwrap()
	}

	#[test]
	fn image_ids_point_at_the_file_route() {
		let config = load(
			r#"
			[server.http]
			public_url = "https://viewer.example.org/"
			"#,
		);
		assert_eq!(
			config.server.http.image_id("abc-1"),
			"wadouri:https://viewer.example.org/api/instances/abc-1/file"
		);
	}

	#[test]
	fn defaults_are_complete() {
		let config = load("");
		assert_eq!(config.telemetry.level, Level::INFO);
		assert!(config.telemetry.sentry.is_none());
		assert_eq!(config.server.http.port, 8080);
		assert_eq!(config.pacs.backend, PacsBackend::Orthanc);
		assert_eq!(config.conversion.bit_depth, 16);
		assert_eq!(config.conversion.max_volumes, 3);
		assert_eq!(config.conversion.classic_rotation, Rotation::None);
		assert_eq!(config.conversion.identity_policy, IdentityPolicy::Placeholders);
		assert_eq!(config.segmentation.series_number, 999);
	}

	#[test]
	fn default_segmentation_matches_the_encoder_defaults() {
		let options = SegmentationOptions::from(&load("").segmentation);
		assert_eq!(options, SegmentationOptions::default());
	}

	#[test]
	fn overrides_replace_defaults() {
		let config = load(
			r#"
			[telemetry]
			level = "debug"

			[pacs]
			backend = "memory"
			url = "http://pacs.example.org:8042/"

			[conversion]
			enhanced_rotation = "ccw90"
			identity_policy = "strict"

			[conversion.windows.FLAIR]
			center = 300.0
			width = 600.0
			"#,
		);

		assert_eq!(config.telemetry.level, Level::DEBUG);
		assert_eq!(config.pacs.backend, PacsBackend::Memory);
		assert_eq!(config.pacs.url.host_str(), Some("pacs.example.org"));
		assert_eq!(config.conversion.enhanced_rotation, Rotation::Ccw90);
		assert_eq!(config.conversion.identity_policy, IdentityPolicy::Strict);
		assert_eq!(
			config.conversion.window("flair"),
			Some(Window {
				center: 300.0,
				width: 600.0
			})
		);
		assert_eq!(config.conversion.window("DWI"), None);
	}

	#[test]
	fn manual_segments_carry_no_algorithm() {
		let config = load(
			r#"
			[segmentation]
			algorithm_type = "MANUAL"
			"#,
		);
		let options = SegmentationOptions::from(&config.segmentation);
		assert!(options.segments[0].algorithm.is_none());
	}
}
