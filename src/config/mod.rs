use crate::types::AE;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;

const DEFAULTS: &str = include_str!("defaults.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: DimseServerConfig,
	pub storage: StorageConfig,
}

impl AppConfig {
	/// Loads the configuration from the built-in defaults, an optional `config.toml` in the
	/// working directory and `STORE_SCP_` prefixed environment variables (in that order).
	pub fn new() -> Result<Self, ConfigError> {
		Self::builder()
			.add_source(File::with_name("config.toml").required(false))
			.add_source(
				Environment::with_prefix("STORE_SCP")
					.prefix_separator("_")
					.separator("__"),
			)
			.build()?
			.try_deserialize()
	}

	fn builder() -> ConfigBuilder<DefaultState> {
		Config::builder().add_source(File::from_str(DEFAULTS, FileFormat::Toml))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	#[serde(deserialize_with = "deserialize_level")]
	pub level: LevelFilter,
	/// Sentry DSN. Sentry is disabled if absent.
	pub sentry: Option<String>,
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
	D: Deserializer<'de>,
{
	let value = String::deserialize(deserializer)?;
	value.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimseServerConfig {
	/// The application entity title this storage SCP answers to.
	pub aet: AE,
	/// The interface the DIMSE server will be listening on.
	pub interface: IpAddr,
	/// The port for the DIMSE server.
	pub port: u16,
	/// Only accept transfer syntaxes that do not require a codec.
	pub uncompressed: bool,
	/// Maximum PDU length announced to the association requestor.
	pub max_pdu_length: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
	/// Directory for received instances, one file per SOP Instance UID.
	pub directory: PathBuf,
	/// Directory for documents extracted from Encapsulated PDF instances.
	pub output_directory: PathBuf,
	pub file_extension: String,
	pub document_extension: String,
	pub failure_mode: FailureMode,
}

/// Controls which handler outcomes are reported to the sending AE as non-success statuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
	/// Filesystem and extraction errors are only logged, the sender always sees success.
	#[default]
	Compatible,
	/// Filesystem errors fail the C-STORE, extraction errors produce a warning status.
	Strict,
}
