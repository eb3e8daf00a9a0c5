//! Main entry point for the delivery dispatcher.
//!
//! Loads the configuration, wires storage, queue and provider
//! implementations through the factory registry, then runs the dispatch
//! engine alongside the HTTP ingress and the outbound event forwarder until
//! interrupted.

use clap::Parser;
use dispatch_config::Config;
use std::path::PathBuf;
use std::sync::Arc;

mod factory_registry;
mod forwarder;
mod server;

/// Command-line arguments for the dispatcher.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, env = "DISPATCHER_CONFIG", default_value = "config/dispatcher.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started dispatcher");

	let config_path = args.config.to_string_lossy().into_owned();
	let config = Config::from_file(&config_path).await?;
	tracing::info!("Loaded configuration [{}]", config.dispatch.id);

	let engine = factory_registry::build_dispatcher_from_config(config.clone(), &args.config)?;
	let engine = Arc::new(engine);

	let forwarder = forwarder::EventForwarder::new(config.events.outbound_url.clone())?;
	let forward_task = tokio::spawn(forwarder.run(engine.event_bus().subscribe()));

	match config.api.clone().filter(|api| api.enabled) {
		Some(api_config) => {
			let api_engine = Arc::clone(&engine);

			tokio::select! {
				result = engine.run() => {
					tracing::info!("Dispatcher finished");
					result?;
				}
				result = server::start_server(api_config, api_engine) => {
					tracing::info!("API server finished");
					result?;
				}
			}
		},
		None => {
			tracing::info!("Starting dispatcher without HTTP ingress");
			engine.run().await?;
		},
	}

	forward_task.abort();
	tracing::info!("Stopped dispatcher");
	Ok(())
}
