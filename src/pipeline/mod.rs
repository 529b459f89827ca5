//! Turns staged volumes into stored DICOM series.
//!
//! A [`Pipeline`] wraps the archive handle of one request. Classic series are stored slice by
//! slice with bounded concurrency, enhanced and segmentation objects are stored whole. Failures
//! name the stage and the slice they happened at, so a caller can retry just that unit.

pub mod staging;

use crate::assembly::classic::ClassicAssembler;
use crate::assembly::reidentify::reidentify;
use crate::assembly::segmentation::{self, SegmentationOptions};
use crate::assembly::{
	enhanced, AssemblyError, DicomInstance, Equipment, IdentityPolicy, PatientIdentity,
	ReferenceSeries, SeriesSpec, SourceInstance, StudyContext,
};
use crate::backend::{PacsTransport, StoredInstance, TransportError};
use crate::config::AppConfig;
use crate::geometry::{self, Geometry, GeometryError};
use crate::transcode::{
	to_binary_mask, to_continuous, PixelBuffer, Rotation, TranscodeError, Window,
};
use crate::types::Uid;
use crate::volume::{Volume, VolumeError};
use bytes::Bytes;
use futures::{future, stream, StreamExt};
use serde::{Deserialize, Serialize};
use staging::Staging;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Foreground value of masks stored as classic images.
const MASK_FOREGROUND: u8 = 255;
const MASK_THRESHOLD: f32 = 0.5;

/// The step of a conversion that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
	Staging,
	Load,
	Geometry,
	Transcode,
	Assembly,
	Store,
	Verify,
}

impl fmt::Display for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Staging => "staging",
			Self::Load => "load",
			Self::Geometry => "geometry",
			Self::Transcode => "transcode",
			Self::Assembly => "assembly",
			Self::Store => "store",
			Self::Verify => "verify",
		};
		f.write_str(name)
	}
}

#[derive(Debug, Error)]
pub enum Cause {
	#[error("{0}")]
	Request(String),
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Volume(#[from] VolumeError),
	#[error(transparent)]
	Geometry(#[from] GeometryError),
	#[error(transparent)]
	Transcode(#[from] TranscodeError),
	#[error(transparent)]
	Assembly(#[from] AssemblyError),
	#[error(transparent)]
	Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
#[error("{stage} failed{}: {cause}", .index.map(|i| format!(" at slice {i}")).unwrap_or_default())]
pub struct ConversionError {
	pub stage: Stage,
	/// Slice index for per-slice work.
	pub index: Option<usize>,
	#[source]
	pub cause: Cause,
}

impl ConversionError {
	pub fn new(stage: Stage, index: Option<usize>, cause: impl Into<Cause>) -> Self {
		Self {
			stage,
			index,
			cause: cause.into(),
		}
	}

	fn request(message: impl Into<String>) -> Self {
		Self::new(Stage::Load, None, Cause::Request(message.into()))
	}
}

/// Wraps an error of `stage` into a [`ConversionError`].
fn at<E: Into<Cause>>(stage: Stage, index: Option<usize>) -> impl FnOnce(E) -> ConversionError {
	move |err| ConversionError::new(stage, index, err)
}

/// One unit that could not be converted, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
	/// Label of the series the unit belongs to.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub series: Option<String>,
	pub stage: Stage,
	pub index: Option<usize>,
	pub message: String,
}

impl UnitFailure {
	pub fn new(series: Option<&str>, err: &ConversionError) -> Self {
		Self {
			series: series.map(ToOwned::to_owned),
			stage: err.stage,
			index: err.index,
			message: err.cause.to_string(),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportedInstance {
	pub instance_number: u32,
	pub sop_instance_uid: Uid,
	/// Identifier assigned by the archive.
	pub archive_id: String,
	/// Image id a web viewer can load the instance with.
	pub image_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesReport {
	pub label: String,
	pub series_instance_uid: Uid,
	pub sop_class_uid: String,
	/// Stored instances ordered by instance number.
	pub instances: Vec<ReportedInstance>,
	pub failures: Vec<UnitFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleReport {
	pub study_instance_uid: Uid,
	pub series: Vec<SeriesReport>,
	/// Series that could not be stored at all.
	pub failures: Vec<UnitFailure>,
}

impl BundleReport {
	pub fn is_complete(&self) -> bool {
		self.failures.is_empty() && self.series.iter().all(|series| series.failures.is_empty())
	}
}

/// How voxel intensities become pixel values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Encoding {
	Continuous {
		bit_depth: u16,
		window: Option<Window>,
	},
	/// Two-tone 8 bit mask.
	Mask,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesOptions {
	/// Label the series is reported under, also its series description.
	pub label: String,
	pub modality: String,
	pub series_number: u32,
	pub encoding: Encoding,
	pub rotation: Rotation,
}

impl SeriesOptions {
	/// Options for a volume labelled `label` in a bundle. `SEG` and `MASK` volumes are stored
	/// as two-tone classic secondary captures whatever the layout, everything else as MR.
	pub fn for_label(label: &str, series_number: u32, layout: Layout, config: &AppConfig) -> Self {
		let conversion = &config.conversion;
		let is_mask = ["SEG", "MASK"]
			.iter()
			.any(|mask| label.eq_ignore_ascii_case(mask));
		let (modality, encoding) = if is_mask {
			("OT", Encoding::Mask)
		} else {
			(
				"MR",
				Encoding::Continuous {
					bit_depth: conversion.bit_depth,
					window: conversion.window(label),
				},
			)
		};

		Self {
			label: label.to_owned(),
			modality: modality.to_owned(),
			series_number,
			encoding,
			rotation: match layout {
				Layout::Enhanced if !is_mask => conversion.enhanced_rotation,
				_ => conversion.classic_rotation,
			},
		}
	}

	fn series(&self) -> SeriesSpec {
		SeriesSpec::new(&self.modality, self.series_number, Some(&self.label))
	}

	fn transcode(&self, volume: &Volume) -> Result<PixelBuffer, TranscodeError> {
		match self.encoding {
			Encoding::Continuous { bit_depth, window } => {
				to_continuous(volume.samples(), bit_depth, self.rotation, window)
			}
			Encoding::Mask => to_binary_mask(
				volume.samples(),
				MASK_THRESHOLD,
				MASK_FOREGROUND,
				self.rotation,
			),
		}
	}
}

/// Multi-frame or one instance per slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
	Classic,
	#[default]
	Enhanced,
}

impl FromStr for Layout {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"classic" => Ok(Self::Classic),
			"enhanced" => Ok(Self::Enhanced),
			other => Err(format!("Unknown layout {other}, expected classic or enhanced")),
		}
	}
}

pub struct LabelledVolume {
	pub label: String,
	pub volume: Volume,
}

pub struct SegmentationRequest {
	pub mask: Volume,
	/// Label of the bundle volume the mask was drawn on. Defaults to the first volume.
	pub reference: Option<String>,
}

pub struct BundleRequest {
	pub study: StudyContext,
	pub layout: Layout,
	pub volumes: Vec<LabelledVolume>,
	pub segmentation: Option<SegmentationRequest>,
}

/// Reads a staged NIfTI volume off the async runtime.
pub async fn load_volume(
	staging: &Staging,
	stem: &str,
	file_name: &str,
	bytes: &[u8],
) -> Result<Volume, ConversionError> {
	let path = staging
		.stage(stem, file_name, bytes)
		.await
		.map_err(at(Stage::Staging, None))?;
	blocking(Stage::Load, move || {
		Volume::open(path).map_err(at(Stage::Load, None))
	})
	.await
}

/// Runs CPU-bound work on the blocking pool so request handling and streaming stay responsive.
async fn blocking<T, F>(stage: Stage, work: F) -> Result<T, ConversionError>
where
	T: Send + 'static,
	F: FnOnce() -> Result<T, ConversionError> + Send + 'static,
{
	tokio::task::spawn_blocking(work)
		.await
		.map_err(|err| ConversionError::new(stage, None, std::io::Error::other(err)))?
}

/// Resolves geometry for the frames `options` produces from `volume`, and transcodes them.
fn prepare(
	volume: &Volume,
	options: &SeriesOptions,
) -> Result<(Geometry, PixelBuffer), ConversionError> {
	let geometry =
		geometry::resolve_rotated(volume.affine(), volume.samples().dim(), options.rotation)
			.map_err(at(Stage::Geometry, None))?;
	let pixels = options
		.transcode(volume)
		.map_err(at(Stage::Transcode, None))?;
	Ok((geometry, pixels))
}

/// Conversion entry points bound to one archive handle.
pub struct Pipeline<'a> {
	transport: &'a dyn PacsTransport,
	config: &'a AppConfig,
	equipment: Equipment,
	segmentation: SegmentationOptions,
}

impl<'a> Pipeline<'a> {
	pub fn new(transport: &'a dyn PacsTransport, config: &'a AppConfig) -> Self {
		Self {
			transport,
			config,
			equipment: Equipment::default(),
			segmentation: SegmentationOptions::from(&config.segmentation),
		}
	}

	fn reported(&self, instance: &DicomInstance, stored: StoredInstance) -> ReportedInstance {
		ReportedInstance {
			instance_number: instance.instance_number(),
			sop_instance_uid: instance.sop_instance_uid().clone(),
			image_id: self.config.server.http.image_id(&stored.id),
			archive_id: stored.id,
		}
	}

	async fn store(&self, instance: &DicomInstance) -> Result<ReportedInstance, ConversionError> {
		let stored = self
			.transport
			.store(instance.bytes())
			.await
			.map_err(at(Stage::Store, None))?;
		Ok(self.reported(instance, stored))
	}

	/// Confirms that the archive indexed what was stored under `patient_id`.
	#[instrument(skip(self))]
	async fn verify(&self, patient_id: &str, stored: usize) -> Result<(), ConversionError> {
		let found = self
			.transport
			.find_patient(patient_id)
			.await
			.map_err(at(Stage::Verify, None))?;
		if found.is_empty() {
			error!("Archive accepted instances but does not index the patient");
			return Err(ConversionError::new(
				Stage::Verify,
				None,
				TransportError::IdentityIndexMismatch {
					patient_id: patient_id.to_owned(),
					stored,
				},
			));
		}
		debug!(?found, "Patient is indexed");
		Ok(())
	}

	/// Stores `volume` as one instance per slice.
	///
	/// Slices are assembled and stored independently. A failing slice is reported and the
	/// others carry on; the call only fails when no slice could be stored.
	pub async fn convert_classic(
		&self,
		study: &StudyContext,
		volume: Volume,
		options: &SeriesOptions,
	) -> Result<SeriesReport, ConversionError> {
		self.classic(study, volume, options)
			.await
			.map(|(report, _)| report)
	}

	#[instrument(skip_all, fields(label = %options.label, slices = volume.slice_count()))]
	async fn classic(
		&self,
		study: &StudyContext,
		volume: Volume,
		options: &SeriesOptions,
	) -> Result<(SeriesReport, ReferenceSeries), ConversionError> {
		let (context, prepared_options) = (study.clone(), options.clone());
		let (series, assembled) = blocking(Stage::Assembly, move || {
			let (geometry, pixels) = prepare(&volume, &prepared_options)?;
			let series = prepared_options.series();
			let assembled: Vec<_> = ClassicAssembler::new(&context, &series, &geometry, &pixels)
				.map_err(at(Stage::Assembly, None))?
				.instances()
				.collect();
			Ok((series, assembled))
		})
		.await?;

		let results: Vec<_> = stream::iter(assembled.into_iter().enumerate())
			.map(|(index, instance)| async move {
				let instance = instance.map_err(at(Stage::Assembly, Some(index)))?;
				let stored = self
					.transport
					.store(instance.bytes())
					.await
					.map_err(at(Stage::Store, Some(index)))?;
				let source = SourceInstance {
					sop_class_uid: instance.sop_class_uid().to_owned(),
					sop_instance_uid: instance.sop_instance_uid().clone(),
					number_of_frames: 1,
				};
				Ok::<_, ConversionError>((self.reported(&instance, stored), source))
			})
			.buffer_unordered(self.config.pacs.concurrency.max(1))
			.collect()
			.await;

		let mut stored = Vec::with_capacity(results.len());
		let mut errors = Vec::new();
		for result in results {
			match result {
				Ok(unit) => stored.push(unit),
				Err(err) => {
					warn!(stage = %err.stage, index = ?err.index, "Slice failed: {}", err.cause);
					errors.push(err);
				}
			}
		}
		errors.sort_by_key(|err| err.index);
		if stored.is_empty() && !errors.is_empty() {
			return Err(errors.remove(0));
		}
		stored.sort_by_key(|(reported, _)| reported.instance_number);

		let patient_id = study.patient_id().map_err(at(Stage::Verify, None))?;
		self.verify(patient_id, stored.len()).await?;
		info!(stored = stored.len(), failed = errors.len(), "Stored classic series");

		let (instances, sources): (Vec<_>, Vec<_>) = stored.into_iter().unzip();
		let sop_class_uid = sources
			.first()
			.map(|source| source.sop_class_uid.clone())
			.unwrap_or_default();
		let reference = ReferenceSeries {
			series_instance_uid: series.series_instance_uid.clone(),
			frame_of_reference_uid: series.frame_of_reference_uid.clone(),
			instances: sources,
			rotation: options.rotation,
		};
		let report = SeriesReport {
			label: options.label.clone(),
			series_instance_uid: series.series_instance_uid,
			sop_class_uid,
			instances,
			failures: errors
				.iter()
				.map(|err| UnitFailure::new(Some(&options.label), err))
				.collect(),
		};
		Ok((report, reference))
	}

	/// Stores `volume` as a single multi-frame instance.
	pub async fn convert_enhanced(
		&self,
		study: &StudyContext,
		volume: Volume,
		options: &SeriesOptions,
	) -> Result<SeriesReport, ConversionError> {
		self.enhanced(study, volume, options)
			.await
			.map(|(report, _)| report)
	}

	#[instrument(skip_all, fields(label = %options.label, slices = volume.slice_count()))]
	async fn enhanced(
		&self,
		study: &StudyContext,
		volume: Volume,
		options: &SeriesOptions,
	) -> Result<(SeriesReport, ReferenceSeries), ConversionError> {
		let (context, prepared_options) = (study.clone(), options.clone());
		let equipment = self.equipment.clone();
		let (series, instance) = blocking(Stage::Assembly, move || {
			let (geometry, pixels) = prepare(&volume, &prepared_options)?;
			let series = prepared_options.series();
			let instance = enhanced::assemble(&context, &series, &equipment, &geometry, &pixels)
				.map_err(at(Stage::Assembly, None))?;
			Ok((series, instance))
		})
		.await?;

		let reported = self.store(&instance).await?;
		info!(archive_id = %reported.archive_id, "Stored enhanced instance");

		let reference = ReferenceSeries::from_assembled(
			&series,
			std::slice::from_ref(&instance),
			options.rotation,
		);
		let report = SeriesReport {
			label: options.label.clone(),
			series_instance_uid: series.series_instance_uid,
			sop_class_uid: instance.sop_class_uid().to_owned(),
			instances: vec![reported],
			failures: Vec::new(),
		};
		Ok((report, reference))
	}

	/// Stores `volume` in the layout requested for the bundle. Masks always become classic
	/// secondary captures, since they do not fit the Enhanced MR IOD.
	async fn series(
		&self,
		study: &StudyContext,
		volume: Volume,
		options: &SeriesOptions,
		layout: Layout,
	) -> Result<(SeriesReport, ReferenceSeries), ConversionError> {
		match (layout, options.encoding) {
			(Layout::Classic, _) | (Layout::Enhanced, Encoding::Mask) => {
				self.classic(study, volume, options).await
			}
			(Layout::Enhanced, Encoding::Continuous { .. }) => {
				self.enhanced(study, volume, options).await
			}
		}
	}

	/// Stores `mask` as a segmentation of `reference`.
	#[instrument(skip_all, fields(reference = %reference.series_instance_uid))]
	pub async fn convert_segmentation(
		&self,
		study: &StudyContext,
		mask: Volume,
		reference: &ReferenceSeries,
		options: Option<&SegmentationOptions>,
	) -> Result<SeriesReport, ConversionError> {
		let options = options.unwrap_or(&self.segmentation).clone();
		let (context, referenced) = (study.clone(), reference.clone());
		let (instance, options) = blocking(Stage::Assembly, move || {
			let instance = segmentation::encode(&context, &mask, &referenced, &options)
				.map_err(at(Stage::Assembly, None))?;
			Ok((instance, options))
		})
		.await?;
		let reported = self.store(&instance).await?;
		info!(archive_id = %reported.archive_id, "Stored segmentation");

		Ok(SeriesReport {
			label: options.series_description,
			series_instance_uid: instance.series_instance_uid().clone(),
			sop_class_uid: instance.sop_class_uid().to_owned(),
			instances: vec![reported],
			failures: Vec::new(),
		})
	}

	/// Converts every volume of `request` concurrently under one study, then the segmentation
	/// against the volume it references.
	#[instrument(skip_all, fields(study = %request.study.study_instance_uid))]
	pub async fn convert_bundle(
		&self,
		request: BundleRequest,
	) -> Result<BundleReport, ConversionError> {
		let BundleRequest {
			study,
			layout,
			volumes,
			segmentation,
		} = request;
		let Some(first_label) = volumes.first().map(|volume| volume.label.clone()) else {
			return Err(ConversionError::request("At least one volume is required"));
		};
		let max_volumes = self.config.conversion.max_volumes;
		if volumes.len() > max_volumes {
			return Err(ConversionError::request(format!(
				"At most {max_volumes} volumes can be converted at once, got {}",
				volumes.len()
			)));
		}

		let count = volumes.len();
		let mut report = BundleReport {
			study_instance_uid: study.study_instance_uid.clone(),
			series: Vec::with_capacity(count + 1),
			failures: Vec::new(),
		};
		let study = &study;
		let conversions = volumes.into_iter().zip(1..).map(|(volume, number)| {
			let options = SeriesOptions::for_label(&volume.label, number, layout, self.config);
			async move {
				let result = self.series(study, volume.volume, &options, layout).await;
				(volume.label, result)
			}
		});

		let mut references = Vec::with_capacity(count);
		for (label, result) in future::join_all(conversions).await {
			match result {
				Ok((series, reference)) => {
					report.series.push(series);
					references.push((label, reference));
				}
				Err(err) => {
					error!(label, "Series failed: {err}");
					report.failures.push(UnitFailure::new(Some(label.as_str()), &err));
				}
			}
		}

		if let Some(SegmentationRequest { mask, reference }) = segmentation {
			let label = reference.unwrap_or(first_label);
			let result = match references
				.iter()
				.find(|(candidate, _)| candidate.eq_ignore_ascii_case(&label))
			{
				Some((_, reference)) => {
					self.convert_segmentation(study, mask, reference, None)
						.await
				}
				None => Err(ConversionError::new(
					Stage::Assembly,
					None,
					Cause::Request(format!("Reference series {label} was not stored")),
				)),
			};
			match result {
				Ok(series) => report.series.push(series),
				Err(err) => {
					error!("Segmentation failed: {err}");
					report.failures.push(UnitFailure::new(Some("SEG"), &err));
				}
			}
		}

		Ok(report)
	}

	/// Stores an existing DICOM file under a new patient identity and checks that the archive
	/// indexed it.
	#[instrument(skip_all)]
	pub async fn upload_instance(
		&self,
		bytes: Bytes,
		patient: &PatientIdentity,
		policy: IdentityPolicy,
	) -> Result<SeriesReport, ConversionError> {
		let identity = patient.clone();
		let instance = blocking(Stage::Assembly, move || {
			reidentify(&bytes, &identity, policy).map_err(at(Stage::Assembly, None))
		})
		.await?;
		let reported = self.store(&instance).await?;

		let context = StudyContext::new(patient.clone(), None, policy);
		let patient_id = context.patient_id().map_err(at(Stage::Verify, None))?;
		self.verify(patient_id, 1).await?;

		Ok(SeriesReport {
			label: "upload".to_owned(),
			series_instance_uid: instance.series_instance_uid().clone(),
			sop_class_uid: instance.sop_class_uid().to_owned(),
			instances: vec![reported],
			failures: Vec::new(),
		})
	}
}
