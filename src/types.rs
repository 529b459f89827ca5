use chrono::{NaiveDate, NaiveDateTime};
use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, Length, PrimitiveValue, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// UID root for UUID-derived identifiers.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part05/sect_B.2.html>
const UUID_ROOT: &str = "2.25";

/// A DICOM Unique Identifier (UI).
///
/// Validated on construction: at most 64 characters, dot-separated numeric components
/// without leading zeros.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
	pub const MAX_LENGTH: usize = 64;

	/// Generates a new UID under the 2.25 root from a random UUID.
	pub fn generate() -> Self {
		Self(format!("{UUID_ROOT}.{}", Uuid::new_v4().as_u128()))
	}

	pub fn new(value: impl Into<String>) -> Result<Self, UidError> {
		let value = value.into();
		// DICOM pads odd-length UIDs with a trailing NUL
		let value = value.trim_end_matches(['\0', ' ']).to_owned();

		if value.is_empty() {
			return Err(UidError::Empty);
		}
		if value.len() > Self::MAX_LENGTH {
			return Err(UidError::TooLong {
				length: value.len(),
			});
		}
		for component in value.split('.') {
			let valid = !component.is_empty()
				&& component.bytes().all(|b| b.is_ascii_digit())
				&& (component == "0" || !component.starts_with('0'));
			if !valid {
				return Err(UidError::Malformed { value });
			}
		}

		Ok(Self(value))
	}

	/// Keeps a supplied UID if it is valid and regenerates it otherwise.
	///
	/// Upstream templates occasionally carry UIDs longer than 64 characters. Those are
	/// replaced instead of failing the whole conversion.
	pub fn or_generate(value: Option<&str>) -> Self {
		match value.map(Self::new) {
			Some(Ok(uid)) => uid,
			Some(Err(err)) => {
				let uid = Self::generate();
				warn!(%uid, "Regenerated invalid UID: {err}");
				uid
			}
			None => Self::generate(),
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Display for Uid {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl AsRef<str> for Uid {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

impl FromStr for Uid {
	type Err = UidError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}

impl From<&Uid> for PrimitiveValue {
	fn from(uid: &Uid) -> Self {
		Self::from(uid.0.clone())
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UidError {
	#[error("UID is empty")]
	Empty,
	#[error("UID has {length} characters, at most 64 are allowed")]
	TooLong { length: usize },
	#[error("UID {value} is not a dot-separated list of numbers")]
	Malformed { value: String },
}

/// A Decimal String (DS) value.
///
/// Rendered with up to 8 fractional digits. The precision is reduced until the value fits
/// the 16 character limit of the DS value representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecimalString(String);

impl DecimalString {
	pub const MAX_LENGTH: usize = 16;
	const PRECISION: usize = 8;

	pub fn new(value: f64) -> Result<Self, DecimalStringError> {
		if !value.is_finite() {
			return Err(DecimalStringError::NonFinite { value });
		}
		// Avoid "-0"
		let value = if value == 0.0 { 0.0 } else { value };

		for precision in (0..=Self::PRECISION).rev() {
			let text = format!("{value:.precision$}");
			let text = if text.contains('.') {
				text.trim_end_matches('0').trim_end_matches('.')
			} else {
				text.as_str()
			};
			let text = if text == "-0" { "0" } else { text };
			if text.len() <= Self::MAX_LENGTH {
				return Ok(Self(text.to_owned()));
			}
		}

		let text = format!("{value:.6e}");
		if text.len() <= Self::MAX_LENGTH {
			Ok(Self(text))
		} else {
			Err(DecimalStringError::TooLong { value })
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Display for DecimalString {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Error, PartialEq)]
pub enum DecimalStringError {
	#[error("{value} cannot be encoded as a decimal string")]
	NonFinite { value: f64 },
	#[error("{value} does not fit into 16 characters")]
	TooLong { value: f64 },
}

/// Builds a multi-valued DS element.
pub fn decimal_strings(
	tag: Tag,
	values: &[f64],
) -> Result<DataElement<InMemDicomObject>, DecimalStringError> {
	let strings = values
		.iter()
		.map(|&v| DecimalString::new(v).map(|ds| ds.0))
		.collect::<Result<Vec<_>, _>>()?;
	Ok(DataElement::new(
		tag,
		VR::DS,
		PrimitiveValue::Strs(strings.into_iter().collect()),
	))
}

/// A coded concept from a controlled terminology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodedConcept {
	pub value: String,
	pub scheme: String,
	pub meaning: String,
}

impl CodedConcept {
	pub fn new(value: &str, scheme: &str, meaning: &str) -> Self {
		Self {
			value: value.to_owned(),
			scheme: scheme.to_owned(),
			meaning: meaning.to_owned(),
		}
	}

	/// A code sequence item (Code Value, Coding Scheme Designator, Code Meaning).
	pub fn to_item(&self) -> InMemDicomObject {
		InMemDicomObject::from_element_iter([
			DataElement::new(tags::CODE_VALUE, VR::SH, dicom_value!(Str, self.value.clone())),
			DataElement::new(
				tags::CODING_SCHEME_DESIGNATOR,
				VR::SH,
				dicom_value!(Str, self.scheme.clone()),
			),
			DataElement::new(tags::CODE_MEANING, VR::LO, dicom_value!(Str, self.meaning.clone())),
		])
	}

	/// A single-item code sequence element.
	pub fn to_sequence(&self, tag: Tag) -> DataElement<InMemDicomObject> {
		sequence(tag, vec![self.to_item()])
	}
}

/// Builds a sequence (SQ) element of undefined length.
pub fn sequence(tag: Tag, items: Vec<InMemDicomObject>) -> DataElement<InMemDicomObject> {
	DataElement::new(
		tag,
		VR::SQ,
		Value::Sequence(DataSetSequence::new(items, Length::UNDEFINED)),
	)
}

/// A Person Name (PN) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonName(String);

impl PersonName {
	/// Converts a free-text display name into a person name.
	///
	/// Existing component separators are kept. Otherwise whitespace separates components.
	pub fn from_display(name: &str) -> Self {
		let name = name.trim();
		if name.contains('^') {
			return Self(name.to_owned());
		}
		Self(name.split_whitespace().collect::<Vec<_>>().join("^"))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

/// Administrative sex of the patient (0010,0040).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Sex {
	Male,
	Female,
	Other,
}

impl Sex {
	pub const fn code(self) -> &'static str {
		match self {
			Self::Male => "M",
			Self::Female => "F",
			Self::Other => "O",
		}
	}
}

impl FromStr for Sex {
	type Err = ParseSexError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_uppercase().as_str() {
			"M" | "MALE" => Ok(Self::Male),
			"F" | "FEMALE" => Ok(Self::Female),
			"O" | "OTHER" => Ok(Self::Other),
			_ => Err(ParseSexError(s.to_owned())),
		}
	}
}

#[derive(Debug, Error)]
#[error("{0} is not one of M, F or O")]
pub struct ParseSexError(String);

/// Formats a date as a DA value (YYYYMMDD).
pub fn da(date: NaiveDate) -> String {
	date.format("%Y%m%d").to_string()
}

/// Formats a time as a TM value (HHMMSS.FFFFFF).
pub fn tm(time: NaiveDateTime) -> String {
	time.format("%H%M%S%.6f").to_string()
}

/// Parses a DA value.
pub fn parse_da(value: &str) -> Result<NaiveDate, chrono::ParseError> {
	NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
}
