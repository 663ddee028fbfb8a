use super::write_atomic;
use crate::dimse::ReceivedObject;
use dicom::core::value::ConvertValueError;
use dicom::dictionary_std::tags;
use dicom::object::Tag;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ExtractError {
	#[error("Missing attribute {0}")]
	MissingAttribute(Tag),
	#[error("'{0}' cannot be used as a file name")]
	UnsafeFileName(String),
	#[error("Failed to read the encapsulated document: {0}")]
	Payload(#[from] ConvertValueError),
	#[error("Failed to write the encapsulated document: {0}")]
	Io(#[from] std::io::Error),
}

/// Normalizes a Patient's Birth Date for use in file names.
///
/// Values of exactly eight characters are kept. Anything else is spliced together from
/// the character ranges `[..4]`, `[4..6]` and `[6..]`, each clamped to the value length.
pub fn normalize_birth_date(value: &str) -> String {
	let chars: Vec<char> = value.chars().collect();
	if chars.len() == 8 {
		return value.to_owned();
	}

	let split = |from: usize, to: usize| -> String {
		let to = to.min(chars.len());
		let from = from.min(to);
		chars[from..to].iter().collect()
	};

	format!(
		"{}{}{}",
		split(0, 4),
		split(4, 6),
		split(6, chars.len())
	)
}

/// Writes the Encapsulated Document of `object` to `{output_dir}/{patient_id}_{birth_date}.{extension}`.
///
/// Returns `Ok(None)` if the object carries no (or an empty) Encapsulated Document.
pub async fn extract_document(
	object: &ReceivedObject,
	output_dir: &Path,
	extension: &str,
) -> Result<Option<PathBuf>, ExtractError> {
	let patient_id = object
		.patient_id()
		.ok_or(ExtractError::MissingAttribute(tags::PATIENT_ID))?;
	let birth_date = object
		.patient_birth_date()
		.ok_or(ExtractError::MissingAttribute(tags::PATIENT_BIRTH_DATE))?;

	let file_name = format!(
		"{patient_id}_{}.{extension}",
		normalize_birth_date(&birth_date)
	);
	if file_name.contains(['/', '\\']) {
		return Err(ExtractError::UnsafeFileName(file_name));
	}
	let path = output_dir.join(file_name);

	let Some(element) = object.encapsulated_document() else {
		warn!(
			patient_id = patient_id.as_ref(),
			"Encapsulated PDF instance has no Encapsulated Document, nothing to extract"
		);
		return Ok(None);
	};
	let document = element.to_bytes()?;
	if document.is_empty() {
		warn!(
			patient_id = patient_id.as_ref(),
			"Encapsulated Document is empty, nothing to extract"
		);
		return Ok(None);
	}

	write_atomic(&path, &document).await?;
	debug!(path = %path.display(), bytes = document.len(), "Extracted encapsulated document");
	Ok(Some(path))
}
