pub mod storescp;

use crate::dimse::DATA_SET_MISSING;
use crate::types::{UI, US};
use dicom::core::{DataElement, Tag, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{FileDicomObject, InMemDicomObject};
use std::borrow::Cow;

// Magic numbers defined by the DICOM standard (PS3.7).
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// Failure: Refused: Out of Resources
pub const STATUS_OUT_OF_RESOURCES: US = 0xA700;
/// Failure: Cannot understand
pub const STATUS_CANNOT_UNDERSTAND: US = 0xC000;
/// Warning: Coercion of Data Elements
pub const STATUS_WARNING: US = 0xB000;

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
}

impl From<CompositeStoreResponse> for InMemDicomObject {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		Self::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		])
	}
}

/// An instance received through a C-STORE-RQ, together with the file meta group
/// that describes how it was transferred.
///
/// The object is owned by the dispatch call and dropped once the handler returns.
#[derive(Debug, Clone)]
pub struct ReceivedObject {
	file: FileDicomObject<InMemDicomObject>,
}

impl ReceivedObject {
	pub const fn new(file: FileDicomObject<InMemDicomObject>) -> Self {
		Self { file }
	}

	/// SOP Instance UID (0008,0018) of the data set.
	pub fn sop_instance_uid(&self) -> Option<Cow<'_, str>> {
		self.string(tags::SOP_INSTANCE_UID)
	}

	/// SOP Class UID (0008,0016) of the data set.
	pub fn sop_class_uid(&self) -> Option<Cow<'_, str>> {
		self.string(tags::SOP_CLASS_UID)
	}

	pub fn patient_id(&self) -> Option<Cow<'_, str>> {
		self.string(tags::PATIENT_ID)
	}

	pub fn patient_birth_date(&self) -> Option<Cow<'_, str>> {
		self.string(tags::PATIENT_BIRTH_DATE)
	}

	/// The Encapsulated Document (0042,0011) element, if the data set carries one.
	pub fn encapsulated_document(&self) -> Option<&InMemElement> {
		self.file.get(tags::ENCAPSULATED_DOCUMENT)
	}

	/// Encodes the instance as a DICOM file (preamble, file meta group and data set).
	pub fn encode(&self) -> Result<Vec<u8>, dicom::object::WriteError> {
		let mut buffer = Vec::new();
		self.file.write_all(&mut buffer)?;
		Ok(buffer)
	}

	fn string(&self, tag: Tag) -> Option<Cow<'_, str>> {
		let value = self.file.get(tag).map(InMemElement::to_str).and_then(Result::ok)?;
		let trimmed = value.trim_end_matches(['\0', ' ']);
		if trimmed.len() == value.len() {
			Some(value)
		} else {
			Some(Cow::Owned(trimmed.to_owned()))
		}
	}
}
