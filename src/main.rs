pub(crate) mod capabilities;
pub(crate) mod config;
pub(crate) mod dimse;
pub(crate) mod storage;
pub(crate) mod types;

use crate::capabilities::Capabilities;
use crate::config::AppConfig;
use crate::dimse::StoreServiceClassProvider;
use crate::storage::StorageEventHandler;
use anyhow::Context;
use tokio::signal;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The implementation class UID written to the file meta group of stored instances.
/// The UID is a randomly generated UUID represented as a single integer value under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.203315736285611590924476384938734301547";

/// The implementation version name written to the file meta group of stored instances.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("STORESCP ", env!("CARGO_PKG_VERSION"));

fn init_logger(level: LevelFilter) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(level.into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(config.telemetry.level);

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	let result = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(config));

	if let Err(error) = result {
		error!("Failed to start application due to error: {error:#}");
		std::process::exit(1);
	}
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let handler = StorageEventHandler::new(config.storage.clone());
	handler.prepare().await.with_context(|| {
		format!(
			"Failed to create storage directories {} and {}",
			config.storage.directory.display(),
			config.storage.output_directory.display()
		)
	})?;
	info!(
		directory = %config.storage.directory.display(),
		output_directory = %config.storage.output_directory.display(),
		failure_mode = ?config.storage.failure_mode,
		"Prepared storage directories"
	);

	let storescp =
		StoreServiceClassProvider::new(handler, Capabilities::storage(), config.server);

	tokio::select! {
		result = storescp.spawn() => result,
		() = shutdown_signal() => {
			info!("Received shutdown signal, no longer accepting associations");
			Ok(())
		}
	}
}

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(err) = signal::ctrl_c().await {
			error!("Failed to listen for Ctrl-C: {err}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			}
			Err(err) => {
				error!("Failed to listen for SIGTERM: {err}");
				std::future::pending::<()>().await;
			}
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		() = ctrl_c => {},
		() = terminate => {},
	}
}
