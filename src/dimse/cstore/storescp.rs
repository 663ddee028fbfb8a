use crate::capabilities::Capabilities;
use crate::config::DimseServerConfig;
use crate::dimse::association::{ServerAssociation, ServerAssociationOptions};
use crate::dimse::cecho::{CompositeEchoResponse, COMMAND_FIELD_COMPOSITE_ECHO_REQUEST};
use crate::dimse::cstore::{
	CompositeStoreResponse, ReceivedObject, COMMAND_FIELD_COMPOSITE_STORE_REQUEST,
	STATUS_CANNOT_UNDERSTAND,
};
use crate::dimse::{DicomMessage, ReadError, ServiceEventHandler};
use crate::types::{UI, US};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use anyhow::Context;
use dicom::dictionary_std::tags;
use dicom::object::FileMetaTableBuilder;
use dicom::ul::Pdu;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StoreServiceClassProvider<H> {
	inner: Arc<InnerStoreServiceClassProvider<H>>,
}

struct InnerStoreServiceClassProvider<H> {
	handler: H,
	capabilities: Capabilities,
	config: DimseServerConfig,
}

impl<H: ServiceEventHandler + 'static> StoreServiceClassProvider<H> {
	pub fn new(handler: H, capabilities: Capabilities, config: DimseServerConfig) -> Self {
		Self {
			inner: Arc::new(InnerStoreServiceClassProvider {
				handler,
				capabilities,
				config,
			}),
		}
	}

	pub async fn spawn(&self) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address).await?;
		for capability in self.inner.capabilities.iter() {
			debug!(
				keyword = capability.keyword,
				uid = capability.uid,
				"Registered abstract syntax"
			);
		}
		info!(
			aet = &self.inner.config.aet,
			"Started Store Service Class Provider on {}",
			address
		);
		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let span = info_span!(
						"STORE-SCP",
						aet = &self.inner.config.aet,
						peer = peer.to_string()
					);
					info!("Accepted incoming connection from {peer}");
					let inner = Arc::clone(&self.inner);
					tokio::spawn(async move {
						if let Err(err) = Self::process(stream, inner).instrument(span).await {
							error!("{err}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			};
		}
	}

	#[instrument(skip_all)]
	async fn process(
		stream: TcpStream,
		inner: Arc<InnerStoreServiceClassProvider<H>>,
	) -> anyhow::Result<()> {
		let tcp_stream = stream.into_std()?;
		// This is required because the `dicom-rs` crate does not use non-blocking reads/writes.
		// The actual reading/writing happens in ServerAssociation, which moves IO operation
		// to another thread.
		tcp_stream.set_nonblocking(false)?;

		let options = ServerAssociationOptions {
			aet: inner.config.aet.clone(),
			tcp_stream,
			abstract_syntaxes: inner.capabilities.abstract_syntaxes(),
			uncompressed: inner.config.uncompressed,
			max_pdu_length: inner.config.max_pdu_length,
		};
		let association = ServerAssociation::new(options).await?;

		loop {
			// Duration::MAX to indefinitely wait for incoming messages
			let message = match association.read_message(Duration::MAX).await {
				Ok(message) => message,
				Err(ReadError::UnexpectedPdu(Pdu::ReleaseRQ)) => {
					debug!("Received A-RELEASE-RQ");
					association.send(Pdu::ReleaseRP, RESPONSE_TIMEOUT).await?;
					return Ok(());
				}
				Err(ReadError::UnexpectedPdu(Pdu::AbortRQ { .. })) => {
					debug!("Association was aborted by the requestor");
					return Ok(());
				}
				Err(err) => return Err(err.into()),
			};

			let command_field = message
				.command_int(tags::COMMAND_FIELD)
				.context("Missing tag COMMAND_FIELD (0000,0100)")?;
			let message_id = message.command_int(tags::MESSAGE_ID).unwrap_or(0);
			let presentation_context_id = message.presentation_context_id;

			match command_field {
				COMMAND_FIELD_COMPOSITE_ECHO_REQUEST => {
					let status = inner.handler.on_echo().await;
					debug!(status, "Answering C-ECHO-RQ");
					let response = CompositeEchoResponse { message_id, status };
					association
						.write_response(response, presentation_context_id, RESPONSE_TIMEOUT)
						.await?;
				}
				COMMAND_FIELD_COMPOSITE_STORE_REQUEST => {
					let response = Self::store(&association, &inner.handler, message, message_id)
						.await
						.context("Failed to handle C-STORE-RQ")?;
					association
						.write_response(response, presentation_context_id, RESPONSE_TIMEOUT)
						.await?;
				}
				_ => {
					return Err(anyhow::Error::msg(format!(
						"Unexpected Command Field {command_field:#06x}. Only C-STORE-RQ and C-ECHO-RQ are supported."
					)));
				}
			}
		}
	}

	async fn store(
		association: &ServerAssociation,
		handler: &H,
		message: DicomMessage,
		message_id: US,
	) -> anyhow::Result<CompositeStoreResponse> {
		let sop_class_uid = message
			.command_str(tags::AFFECTED_SOP_CLASS_UID)
			.unwrap_or_default();
		let sop_instance_uid = message
			.command_str(tags::AFFECTED_SOP_INSTANCE_UID)
			.unwrap_or_default();

		let data = match message.data {
			Some(data) if !sop_class_uid.is_empty() && !sop_instance_uid.is_empty() => data,
			_ => {
				warn!(
					sop_instance_uid = sop_instance_uid.as_str(),
					sop_class_uid = sop_class_uid.as_str(),
					"C-STORE-RQ is missing the affected SOP class, the affected SOP instance or the data set"
				);
				return Ok(CompositeStoreResponse {
					message_id,
					sop_class_uid,
					sop_instance_uid,
					status: STATUS_CANNOT_UNDERSTAND,
				});
			}
		};

		info!(
			sop_instance_uid = sop_instance_uid.as_str(),
			sop_class_uid = sop_class_uid.as_str(),
			"Received instance"
		);

		let pctx = association
			.presentation_contexts()
			.iter()
			.find(|pctx| pctx.id == message.presentation_context_id)
			.context("No presentation context available")?;
		debug!(
			"Used transfer syntax {} to read message",
			pctx.transfer_syntax
		);

		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(sop_class_uid.as_str())
			.media_storage_sop_instance_uid(sop_instance_uid.as_str())
			.transfer_syntax(UI::from(pctx.transfer_syntax.trim_end_matches('\0')))
			.implementation_class_uid(IMPLEMENTATION_CLASS_UID)
			.implementation_version_name(IMPLEMENTATION_VERSION_NAME)
			.build()
			.context("Failed to build file meta group")?;

		let object = ReceivedObject::new(data.with_exact_meta(meta));
		let status = handler.on_store(object).await;
		debug!("Answering C-STORE-RQ with status {status:#06x}");

		Ok(CompositeStoreResponse {
			message_id,
			sop_class_uid,
			sop_instance_uid,
			status,
		})
	}
}
