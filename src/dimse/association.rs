//! Runs a blocking `dicom-ul` server association on its own OS thread.
//! The async side talks to that thread over a command channel, one request at a time.

use crate::types::{AE, UI};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::Association as _;
use dicom::ul::pdu::PresentationContextNegotiated;
use dicom::ul::Pdu;
use std::io::ErrorKind;
use std::{net::TcpStream, thread, time::Duration};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error(transparent)]
	Channel(#[from] ChannelError),
	#[error("Failed to spawn thread")]
	OsThread(std::io::Error),
	#[error("Failed to clone TcpStream: {0}")]
	Stream(std::io::Error),
	#[error(transparent)]
	Association(#[from] dicom::ul::association::Error),
}

#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("Timed out")]
	Timeout,
	#[error("Channel is closed")]
	Closed,
}

#[derive(Debug)]
enum Command {
	Send(Pdu, oneshot::Sender<Result<(), AssociationError>>),
	Receive(oneshot::Sender<Result<Pdu, AssociationError>>),
}

#[derive(Debug)]
pub struct ServerAssociation {
	channel: mpsc::Sender<Command>,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	tcp_stream: TcpStream,
}

pub struct ServerAssociationOptions {
	pub aet: AE,
	pub tcp_stream: TcpStream,
	/// Abstract syntaxes (SOP classes) that will be accepted during negotiation.
	pub abstract_syntaxes: Vec<UI>,
	pub uncompressed: bool,
	pub max_pdu_length: u32,
}

impl ServerAssociation {
	/// Negotiates the association with the requestor connected to `options.tcp_stream`.
	/// Returns once the association is established or was rejected.
	pub async fn new(options: ServerAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.ae_title(options.aet.clone())
			.max_pdu_length(options.max_pdu_length);

		for abstract_syntax in options.abstract_syntaxes {
			server_options = server_options.with_abstract_syntax(abstract_syntax);
		}

		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let (tx, mut rx) = mpsc::channel::<Command>(1);
		let aet = options.aet;
		let tcp_stream = options.tcp_stream;
		let _handle = thread::Builder::new()
			.name(format!("{aet}-server"))
			.spawn(move || {
				let span =
					tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(tcp_stream) {
					Ok(mut association) => {
						info!(
							calling_aet = association.peer_ae_title(),
							called_aet = aet,
							"Established new server association"
						);

						let pcs = association.presentation_contexts().to_vec();

						match association.inner_stream().try_clone() {
							Ok(stream) => {
								connect_tx.send(Ok((stream, pcs))).map_err(|_value| ())?;
							}
							Err(e) => {
								connect_tx
									.send(Err(AssociationError::Stream(e)))
									.map_err(|_value| ())?;
								return Err(());
							}
						}
						association
					}
					Err(e) => {
						connect_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let replied = match command {
						Command::Send(pdu, reply_to) => reply_to
							.send(association.send(&pdu).map_err(AssociationError::from))
							.is_ok(),
						Command::Receive(reply_to) => reply_to
							.send(association.receive().map_err(AssociationError::from))
							.is_ok(),
					};

					if !replied {
						error!("ServerAssociation lost its requestor: {}", ChannelError::Closed);
						return Err(());
					}
				}

				rx.close();

				if let Err(e) = association.abort() {
					match e {
						dicom::ul::association::Error::WireSend { source, .. }
							if source.kind() == ErrorKind::BrokenPipe =>
						{
							// no-op, happens on MacOS if the TCP stream is already closed
						}
						_ => {
							debug!("ServerAssociation.abort() returned error: {e}");
						}
					}
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = connect_result
			.await
			.map_err(|_| AssociationError::Channel(ChannelError::Closed))??;

		Ok(Self {
			channel: tx,
			presentation_contexts,
			tcp_stream,
		})
	}

	pub async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.ask(Command::Receive, timeout).await
	}

	pub async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
	}

	pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}

	/// Hands `command` to the association thread and waits for its reply.
	async fn ask<R>(
		&self,
		command: impl FnOnce(oneshot::Sender<Result<R, AssociationError>>) -> Command,
		timeout: Duration,
	) -> Result<R, AssociationError> {
		let (reply_to, reply) = oneshot::channel();
		tokio::time::timeout(timeout, async {
			self.channel
				.send(command(reply_to))
				.await
				.map_err(|_| ChannelError::Closed)?;

			reply.await.map_err(|_| ChannelError::Closed)
		})
		.await
		.map_err(|_| ChannelError::Timeout)??
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			warn!("TcpStream::shutdown failed: {err}");
		}
	}
}
