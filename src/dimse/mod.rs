//! This module contains the DIMSE side of the storage SCP.
//! - C-ECHO is answered by the verification service class provider.
//! - C-STORE is answered by the storage service class provider, which hands every received
//!     instance to a [`ServiceEventHandler`].
//!

pub mod association;
pub mod cecho;
pub mod cstore;

use crate::types::{UI, US};
use association::{AssociationError, ServerAssociation};
use async_trait::async_trait;
pub use cstore::storescp::StoreServiceClassProvider;
pub use cstore::ReceivedObject;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::fmt::{Debug, Formatter};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Status (0000,0900) value for a successful operation.
pub const STATUS_SUCCESS: US = 0x0000;

/// Receives the events raised by the service class providers.
/// The returned value is sent back to the requestor as the Status (0000,0900) of the response.
#[async_trait]
pub trait ServiceEventHandler: Send + Sync {
	/// Called once per C-STORE-RQ that carried a data set.
	async fn on_store(&self, object: ReceivedObject) -> US;

	/// Called once per C-ECHO-RQ.
	async fn on_echo(&self) -> US;
}

/// A request received from the association requestor: a command set followed by an
/// optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
	/// The presentation context the command set arrived on
	pub presentation_context_id: u8,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

impl DicomMessage {
	/// Reads an integer attribute of the command set.
	pub fn command_int(&self, tag: Tag) -> Option<US> {
		self.command
			.get(tag)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	/// Reads a string attribute of the command set without trailing padding.
	pub fn command_str(&self, tag: Tag) -> Option<UI> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.trim_end_matches(['\0', ' ']).to_owned())
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("Presentation context {0} was not negotiated")]
	NoPresentationContext(u8),
}

impl ServerAssociation {
	/// Sends a response command set on the presentation context of the request.
	/// Responses of the storage SCP never carry a data set.
	#[instrument(skip_all)]
	pub async fn write_response(
		&self,
		command: impl Into<InMemDicomObject>,
		presentation_context_id: u8,
		timeout: Duration,
	) -> Result<(), WriteError> {
		if !self
			.presentation_contexts()
			.iter()
			.any(|pctx| pctx.id == presentation_context_id)
		{
			return Err(NegotiationError::NoPresentationContext(presentation_context_id).into());
		}

		let command: InMemDicomObject = Into::into(command);
		let mut command_buf = Vec::new();
		command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let command_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id,
				is_last: true,
				data: command_buf,
			}],
		};
		Ok(self.send(command_pdu, timeout).await?)
	}

	/// Reads the next request, reassembling command and data fragments that are spread
	/// over several P-DATA-TF PDUs.
	/// Any other PDU is returned as [`ReadError::UnexpectedPdu`].
	#[instrument(skip_all)]
	pub async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive(timeout).await?;
			let Pdu::PData { data } = pdu else {
				return Err(ReadError::UnexpectedPdu(pdu));
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						trace!("Received command fragment (last={})", pdv.is_last);
						if message_command.is_some() {
							// The command set is complete, the data set must follow
							return Err(ReadError::OutOfOrder);
						}
						command_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let command = InMemDicomObject::read_dataset_with_ts(
								command_fragments.as_slice(),
								&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
							)?;
							let has_data_set = command
								.get(tags::COMMAND_DATA_SET_TYPE)
								.map(InMemElement::to_int::<US>)
								.and_then(Result::ok)
								.is_some_and(|value| value != DATA_SET_MISSING);

							if has_data_set {
								message_command = Some(command);
							} else {
								return Ok(DicomMessage {
									command,
									data: None,
									presentation_context_id: pdv.presentation_context_id,
								});
							}
						}
					}
					PDataValueType::Data => {
						trace!("Received data fragment (last={})", pdv.is_last);
						if message_command.is_none() {
							return Err(ReadError::OutOfOrder);
						}
						data_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let presentation_context = self
								.presentation_contexts()
								.iter()
								.find(|pctx| pctx.id == pdv.presentation_context_id)
								.ok_or(NegotiationError::NoPresentationContext(
									pdv.presentation_context_id,
								))?;
							let transfer_syntax = TransferSyntaxRegistry
								.get(&presentation_context.transfer_syntax)
								.ok_or_else(|| {
									NegotiationError::UnknownTransferSyntax(UI::from(
										&presentation_context.transfer_syntax,
									))
								})?;
							let data = InMemDicomObject::read_dataset_with_ts(
								data_fragments.as_slice(),
								transfer_syntax,
							)?;

							let command = message_command.ok_or(ReadError::OutOfOrder)?;
							return Ok(DicomMessage {
								command,
								data: Some(data),
								presentation_context_id: pdv.presentation_context_id,
							});
						}
					}
				}
			}
		}
	}
}
