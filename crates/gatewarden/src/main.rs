use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gatewarden::api::{self, AppState};
use gatewarden::pki::rotation;
use gatewarden::store::MemStore;
use gatewarden::{Settings, janitor};
use tracing::info;
use warden_core::signal::{Shutdown, drain};
use warden_core::telemetry;

#[derive(Parser)]
#[command(name = "gatewarden", about = "zero-trust access control plane")]
struct Args {
	/// Path to the YAML settings file; defaults apply when absent.
	#[arg(long, default_value = "gatewarden.yaml")]
	config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();
	let settings = if args.config.exists() {
		Settings::from_file(&args.config)?
	} else {
		info!(path = %args.config.display(), "no settings file, using defaults");
		Settings::default()
	};
	let settings = Arc::new(settings);

	let store = Arc::new(MemStore::new());
	let root = rotation::ensure_root(store.as_ref(), &settings)?;
	info!(fingerprint = %root.fingerprint, "PKI ready");

	let (drain_trigger, drain_watcher) = drain::new();
	tokio::spawn(janitor::run(
		store.clone(),
		settings.clone(),
		drain_watcher.clone(),
	));
	drop(drain_watcher);

	let app = api::router(AppState::new(store, settings.clone()));
	let listener = tokio::net::TcpListener::bind(settings.listen).await?;
	info!(listen = %settings.listen, "control plane listening");

	let shutdown = Shutdown::new();
	axum::serve(listener, app)
		.with_graceful_shutdown(async move { shutdown.wait().await })
		.await?;

	info!("draining background tasks");
	drain_trigger.start_drain_and_wait().await;
	Ok(())
}
