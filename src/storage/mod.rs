//! Persists received instances and extracts encapsulated PDF documents.
//!
//! Every instance is written to `{directory}/{SOPInstanceUID}.{file_extension}`. A repeated
//! SOP Instance UID replaces the previous file. Instances of the Encapsulated PDF Storage
//! SOP class additionally have their document written to the output directory, see
//! [`extract::extract_document`].

pub mod extract;

use crate::config::{FailureMode, StorageConfig};
use crate::dimse::cstore::{STATUS_CANNOT_UNDERSTAND, STATUS_OUT_OF_RESOURCES, STATUS_WARNING};
use crate::dimse::{ReceivedObject, ServiceEventHandler, STATUS_SUCCESS};
use crate::types::US;
use async_trait::async_trait;
use dicom::dictionary_std::{tags, uids};
use dicom::object::Tag;
use extract::{extract_document, ExtractError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("Missing attribute {0}")]
	MissingAttribute(Tag),
	#[error("SOP Instance UID '{0}' cannot be used as a file name")]
	UnsafeInstanceUid(String),
	#[error("Failed to encode instance: {0}")]
	Encode(#[from] dicom::object::WriteError),
	#[error("Failed to write instance: {0}")]
	Io(#[from] std::io::Error),
}

impl StoreError {
	/// Whether the received data set itself was unusable, as opposed to a local failure.
	pub const fn is_malformed(&self) -> bool {
		matches!(self, Self::MissingAttribute(_) | Self::UnsafeInstanceUid(_))
	}
}

/// The result of handling one received instance.
#[derive(Debug)]
pub enum StoreOutcome {
	Stored {
		path: PathBuf,
		document: Option<PathBuf>,
	},
	StoredButExtractFailed {
		path: PathBuf,
		error: ExtractError,
	},
	Rejected(StoreError),
}

impl StoreOutcome {
	/// Maps the outcome to the Status (0000,0900) of the C-STORE-RSP.
	pub const fn status(&self, mode: FailureMode) -> US {
		match (self, mode) {
			(Self::Stored { .. }, _) => STATUS_SUCCESS,
			(Self::Rejected(err), _) if err.is_malformed() => STATUS_CANNOT_UNDERSTAND,
			(_, FailureMode::Compatible) => STATUS_SUCCESS,
			(Self::StoredButExtractFailed { .. }, FailureMode::Strict) => STATUS_WARNING,
			(Self::Rejected(_), FailureMode::Strict) => STATUS_OUT_OF_RESOURCES,
		}
	}
}

/// Handles C-STORE and C-ECHO events by writing instances to the storage directory.
#[derive(Debug, Clone)]
pub struct StorageEventHandler {
	config: StorageConfig,
}

impl StorageEventHandler {
	pub const fn new(config: StorageConfig) -> Self {
		Self { config }
	}

	/// Creates the storage and output directories if they do not exist yet.
	pub async fn prepare(&self) -> std::io::Result<()> {
		tokio::fs::create_dir_all(&self.config.directory).await?;
		tokio::fs::create_dir_all(&self.config.output_directory).await
	}

	#[instrument(skip_all)]
	pub async fn on_object_received(&self, object: ReceivedObject) -> StoreOutcome {
		let path = match self.persist(&object).await {
			Ok(path) => path,
			Err(err) => return StoreOutcome::Rejected(err),
		};

		let is_encapsulated_pdf = object
			.sop_class_uid()
			.is_some_and(|uid| uid == uids::ENCAPSULATED_PDF_STORAGE);
		if !is_encapsulated_pdf {
			return StoreOutcome::Stored {
				path,
				document: None,
			};
		}

		match extract_document(
			&object,
			&self.config.output_directory,
			&self.config.document_extension,
		)
		.await
		{
			Ok(document) => StoreOutcome::Stored { path, document },
			Err(error) => StoreOutcome::StoredButExtractFailed { path, error },
		}
	}

	pub const fn on_liveness_probe(&self) -> US {
		STATUS_SUCCESS
	}

	async fn persist(&self, object: &ReceivedObject) -> Result<PathBuf, StoreError> {
		let sop_instance_uid = object
			.sop_instance_uid()
			.ok_or(StoreError::MissingAttribute(tags::SOP_INSTANCE_UID))?;
		if object.sop_class_uid().is_none() {
			return Err(StoreError::MissingAttribute(tags::SOP_CLASS_UID));
		}
		if sop_instance_uid.is_empty()
			|| sop_instance_uid == "."
			|| sop_instance_uid == ".."
			|| sop_instance_uid.contains(['/', '\\'])
		{
			return Err(StoreError::UnsafeInstanceUid(sop_instance_uid.into_owned()));
		}

		let path = self.config.directory.join(format!(
			"{sop_instance_uid}.{}",
			self.config.file_extension
		));
		let encoded = object.encode()?;
		write_atomic(&path, &encoded).await?;
		Ok(path)
	}
}

#[async_trait]
impl ServiceEventHandler for StorageEventHandler {
	async fn on_store(&self, object: ReceivedObject) -> US {
		let outcome = self.on_object_received(object).await;
		match &outcome {
			StoreOutcome::Stored { path, document } => {
				info!(path = %path.display(), "Stored instance");
				if let Some(document) = document {
					info!(path = %document.display(), "Extracted encapsulated document");
				}
			}
			StoreOutcome::StoredButExtractFailed { path, error } => {
				warn!(
					path = %path.display(),
					"Stored instance, but failed to extract document: {error}"
				);
			}
			StoreOutcome::Rejected(err) => error!("Failed to store instance: {err}"),
		}
		outcome.status(self.config.failure_mode)
	}

	async fn on_echo(&self) -> US {
		self.on_liveness_probe()
	}
}

/// Writes `contents` to a temporary sibling of `path` and renames it into place, so that
/// readers never observe a partially written file.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
	let partial = PartialFile::next_to(path);
	tokio::fs::write(&partial.path, contents).await?;
	partial.persist(path).await
}

/// A temporary file that is removed again unless it was renamed into place.
struct PartialFile {
	path: PathBuf,
	persisted: bool,
}

impl PartialFile {
	fn next_to(path: &Path) -> Self {
		let file_name = path
			.file_name()
			.map(|name| name.to_string_lossy().into_owned())
			.unwrap_or_default();
		Self {
			path: path.with_file_name(format!(".{file_name}.{}.part", Uuid::new_v4())),
			persisted: false,
		}
	}

	async fn persist(mut self, path: &Path) -> std::io::Result<()> {
		tokio::fs::rename(&self.path, path).await?;
		self.persisted = true;
		Ok(())
	}
}

impl Drop for PartialFile {
	fn drop(&mut self) {
		if self.persisted {
			return;
		}
		match std::fs::remove_file(&self.path) {
			Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
				warn!("Failed to remove {}: {err}", self.path.display());
			}
			_ => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::dimse::cstore::tests::{pdf_elements, received_object};
	use dicom::core::{DataElement, PrimitiveValue, VR};
	use tempfile::TempDir;

	const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

	struct Fixture {
		_root: TempDir,
		handler: StorageEventHandler,
		config: StorageConfig,
	}

	async fn fixture(failure_mode: FailureMode) -> Fixture {
		let root = TempDir::new().unwrap();
		let config = StorageConfig {
			directory: root.path().join("dicom_storage"),
			output_directory: root.path().join("documents"),
			file_extension: String::from("dcm"),
			document_extension: String::from("pdf"),
			failure_mode,
		};
		let handler = StorageEventHandler::new(config.clone());
		handler.prepare().await.unwrap();
		Fixture {
			_root: root,
			handler,
			config,
		}
	}

	fn ct_object(sop_instance_uid: &str) -> ReceivedObject {
		received_object(
			CT_IMAGE_STORAGE,
			vec![
				DataElement::new(
					tags::SOP_CLASS_UID,
					VR::UI,
					PrimitiveValue::from(CT_IMAGE_STORAGE),
				),
				DataElement::new(
					tags::SOP_INSTANCE_UID,
					VR::UI,
					PrimitiveValue::from(sop_instance_uid),
				),
				DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("12345")),
			],
		)
	}

	fn file_count(dir: &Path) -> usize {
		std::fs::read_dir(dir).unwrap().count()
	}

	#[tokio::test]
	async fn store_instance() {
		let fixture = fixture(FailureMode::Compatible).await;
		let object = ct_object("1.2.3.4");
		let expected = object.encode().unwrap();

		let outcome = fixture.handler.on_object_received(object).await;

		let StoreOutcome::Stored { path, document } = outcome else {
			panic!("unexpected outcome {outcome:?}");
		};
		assert_eq!(path, fixture.config.directory.join("1.2.3.4.dcm"));
		assert!(document.is_none());
		assert_eq!(std::fs::read(&path).unwrap(), expected);
		assert_eq!(file_count(&fixture.config.output_directory), 0);
	}

	#[tokio::test]
	async fn stored_file_is_readable() {
		let fixture = fixture(FailureMode::Compatible).await;

		fixture.handler.on_store(ct_object("1.2.3.4")).await;

		let file = dicom::object::open_file(fixture.config.directory.join("1.2.3.4.dcm")).unwrap();
		assert_eq!(file.meta().media_storage_sop_class_uid(), CT_IMAGE_STORAGE);
		assert_eq!(
			file.element(tags::SOP_INSTANCE_UID)
				.unwrap()
				.to_str()
				.unwrap(),
			"1.2.3.4"
		);
	}

	#[tokio::test]
	async fn store_same_instance_twice() {
		let fixture = fixture(FailureMode::Compatible).await;
		let expected = ct_object("1.2.3.4").encode().unwrap();

		fixture.handler.on_object_received(ct_object("1.2.3.4")).await;
		fixture.handler.on_object_received(ct_object("1.2.3.4")).await;

		let path = fixture.config.directory.join("1.2.3.4.dcm");
		assert_eq!(std::fs::read(path).unwrap(), expected);
		// No leftovers from the temporary files
		assert_eq!(file_count(&fixture.config.directory), 1);
	}

	#[tokio::test]
	async fn store_concurrently() {
		let fixture = fixture(FailureMode::Compatible).await;

		let (first, second) = tokio::join!(
			fixture.handler.on_store(ct_object("1.2.3.4")),
			fixture.handler.on_store(ct_object("1.2.3.5")),
		);

		assert_eq!(first, STATUS_SUCCESS);
		assert_eq!(second, STATUS_SUCCESS);
		assert_eq!(
			std::fs::read(fixture.config.directory.join("1.2.3.4.dcm")).unwrap(),
			ct_object("1.2.3.4").encode().unwrap()
		);
		assert_eq!(
			std::fs::read(fixture.config.directory.join("1.2.3.5.dcm")).unwrap(),
			ct_object("1.2.3.5").encode().unwrap()
		);
	}

	#[tokio::test]
	async fn extract_encapsulated_pdf() {
		let fixture = fixture(FailureMode::Compatible).await;
		let object = received_object(
			uids::ENCAPSULATED_PDF_STORAGE,
			pdf_elements("1.2.3.4", "12345", "19800101", Some(b"%PDF-1.4")),
		);

		let status = fixture.handler.on_store(object).await;

		assert_eq!(status, STATUS_SUCCESS);
		assert!(fixture.config.directory.join("1.2.3.4.dcm").exists());
		assert_eq!(
			std::fs::read(fixture.config.output_directory.join("12345_19800101.pdf")).unwrap(),
			b"%PDF-1.4"
		);
	}

	#[tokio::test]
	async fn encapsulated_pdf_without_document() {
		let fixture = fixture(FailureMode::Strict).await;
		let object = received_object(
			uids::ENCAPSULATED_PDF_STORAGE,
			pdf_elements("1.2.3.4", "12345", "19800101", None),
		);

		let outcome = fixture.handler.on_object_received(object).await;

		assert!(matches!(
			outcome,
			StoreOutcome::Stored { document: None, .. }
		));
		assert_eq!(outcome.status(FailureMode::Strict), STATUS_SUCCESS);
		assert!(fixture.config.directory.join("1.2.3.4.dcm").exists());
		assert_eq!(file_count(&fixture.config.output_directory), 0);
	}

	#[tokio::test]
	async fn only_extract_pdf_class() {
		let fixture = fixture(FailureMode::Compatible).await;
		let mut elements = pdf_elements("1.2.3.4", "12345", "19800101", Some(b"%PDF-1.4"));
		elements[0] = DataElement::new(
			tags::SOP_CLASS_UID,
			VR::UI,
			PrimitiveValue::from("1.2.840.10008.5.1.4.1.1.104.2"),
		);
		let object = received_object("1.2.840.10008.5.1.4.1.1.104.2", elements);

		fixture.handler.on_store(object).await;

		assert!(fixture.config.directory.join("1.2.3.4.dcm").exists());
		assert_eq!(file_count(&fixture.config.output_directory), 0);
	}

	#[tokio::test]
	async fn extract_failure_keeps_instance() {
		let compatible = fixture(FailureMode::Compatible).await;
		let strict = fixture(FailureMode::Strict).await;
		let mut elements = pdf_elements("1.2.3.4", "12345", "19800101", Some(b"%PDF-1.4"));
		elements.retain(|element| element.header().tag != tags::PATIENT_BIRTH_DATE);
		let object = received_object(uids::ENCAPSULATED_PDF_STORAGE, elements);

		let outcome = strict.handler.on_object_received(object.clone()).await;

		assert!(matches!(
			outcome,
			StoreOutcome::StoredButExtractFailed {
				error: ExtractError::MissingAttribute(_),
				..
			}
		));
		assert_eq!(outcome.status(FailureMode::Strict), STATUS_WARNING);
		assert_eq!(compatible.handler.on_store(object).await, STATUS_SUCCESS);
		assert!(strict.config.directory.join("1.2.3.4.dcm").exists());
	}

	#[tokio::test]
	async fn reject_missing_instance_uid() {
		let fixture = fixture(FailureMode::Compatible).await;
		let object = received_object(
			CT_IMAGE_STORAGE,
			vec![DataElement::new(
				tags::SOP_CLASS_UID,
				VR::UI,
				PrimitiveValue::from(CT_IMAGE_STORAGE),
			)],
		);

		let status = fixture.handler.on_store(object).await;

		assert_eq!(status, STATUS_CANNOT_UNDERSTAND);
		assert_eq!(file_count(&fixture.config.directory), 0);
	}

	#[tokio::test]
	async fn reject_unsafe_instance_uid() {
		let fixture = fixture(FailureMode::Compatible).await;

		let outcome = fixture
			.handler
			.on_object_received(ct_object("../1.2.3.4"))
			.await;

		assert!(matches!(
			outcome,
			StoreOutcome::Rejected(StoreError::UnsafeInstanceUid(_))
		));
		assert_eq!(outcome.status(FailureMode::Compatible), STATUS_CANNOT_UNDERSTAND);
	}

	#[tokio::test]
	async fn write_failure_depends_on_failure_mode() {
		let root = TempDir::new().unwrap();
		// A regular file where the storage directory is expected
		let blocked = root.path().join("blocked");
		std::fs::write(&blocked, b"").unwrap();
		let config = StorageConfig {
			directory: blocked.clone(),
			output_directory: root.path().join("documents"),
			file_extension: String::from("dcm"),
			document_extension: String::from("pdf"),
			failure_mode: FailureMode::Compatible,
		};
		let compatible = StorageEventHandler::new(config.clone());
		let strict = StorageEventHandler::new(StorageConfig {
			failure_mode: FailureMode::Strict,
			..config
		});

		assert_eq!(compatible.on_store(ct_object("1.2.3.4")).await, STATUS_SUCCESS);
		assert_eq!(strict.on_store(ct_object("1.2.3.4")).await, STATUS_OUT_OF_RESOURCES);
		assert!(matches!(
			strict.on_object_received(ct_object("1.2.3.4")).await,
			StoreOutcome::Rejected(StoreError::Io(_))
		));
	}

	fn partial_files(dir: &Path) -> Vec<String> {
		std::fs::read_dir(dir)
			.unwrap()
			.map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
			.filter(|name| name.ends_with(".part"))
			.collect()
	}

	#[test]
	fn partial_file_is_removed_unless_persisted() {
		let root = TempDir::new().unwrap();
		let target = root.path().join("1.2.3.4.dcm");

		let partial = PartialFile::next_to(&target);
		std::fs::write(&partial.path, b"incomplete").unwrap();
		assert_eq!(partial_files(root.path()).len(), 1);
		// Dropped after a failed write
		drop(partial);

		assert!(partial_files(root.path()).is_empty());
		assert!(!target.exists());
	}

	#[tokio::test]
	async fn failed_rename_leaves_no_partial_file() {
		let root = TempDir::new().unwrap();
		// A non-empty directory cannot be replaced by a file
		let target = root.path().join("1.2.3.4.dcm");
		std::fs::create_dir(&target).unwrap();
		std::fs::write(target.join("occupied"), b"").unwrap();

		let result = write_atomic(&target, b"instance").await;

		assert!(result.is_err());
		assert!(partial_files(root.path()).is_empty());
		assert!(target.is_dir());
	}

	#[tokio::test]
	async fn write_atomic_replaces_target() {
		let root = TempDir::new().unwrap();
		let target = root.path().join("1.2.3.4.dcm");
		std::fs::write(&target, b"old").unwrap();

		write_atomic(&target, b"new").await.unwrap();

		assert_eq!(std::fs::read(&target).unwrap(), b"new");
		assert!(partial_files(root.path()).is_empty());
	}

	#[tokio::test]
	async fn liveness_probe_succeeds() {
		let fixture = fixture(FailureMode::Strict).await;

		assert_eq!(fixture.handler.on_liveness_probe(), STATUS_SUCCESS);
		assert_eq!(fixture.handler.on_echo().await, STATUS_SUCCESS);
		assert_eq!(file_count(&fixture.config.directory), 0);
	}
}
