use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use proxypool::metrics::Metrics;
use proxypool::orchestrator::Orchestrator;
use proxypool::{Config, config, telemetry, version};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Validate the configuration and exit
	#[arg(long)]
	validate_only: bool,

	/// Skip the fetch cycle normally run right after startup
	#[arg(long)]
	no_initial_fetch: bool,

	/// Print version
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();

	if args.version {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to build runtime")
		.block_on(async move {
			let contents = match (args.config, args.file) {
				(Some(_), Some(_)) => {
					anyhow::bail!("only one of --config or --file")
				},
				(Some(config), None) => config,
				(None, Some(file)) => fs_err::read_to_string(&file)?,
				(None, None) => "{}".to_string(),
			};
			let config = config::parse_config(contents)?;
			if args.validate_only {
				println!("Configuration is valid!");
				return Ok(());
			}
			run(Arc::new(config), !args.no_initial_fetch).await
		})
}

async fn run(cfg: Arc<Config>, initial_fetch: bool) -> anyhow::Result<()> {
	info!("version: {}", version::BuildInfo::new());
	info!("running with config: {}", serde_yaml::to_string(cfg.as_ref())?);

	let mut registry = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(Metrics::new(&mut registry));

	let orchestrator = Arc::new(Orchestrator::new(&cfg, metrics)?);

	orchestrator.start().await?;
	if initial_fetch {
		let orchestrator = orchestrator.clone();
		tokio::spawn(async move {
			if let Err(err) = orchestrator.fetch_cycle().await {
				warn!(%err, "initial fetch cycle failed");
			}
		});
	}

	wait_for_shutdown().await;
	// The orchestrator's stop signal fans out to its loops; in-flight cycles
	// get the configured deadline to finish.
	orchestrator.stop().await;
	Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut interrupt = signal(SignalKind::interrupt()).expect("failed to register signal handler");
	let mut terminate = signal(SignalKind::terminate()).expect("failed to register signal handler");
	tokio::select! {
		_ = interrupt.recv() => info!("received SIGINT, shutting down"),
		_ = terminate.recv() => info!("received SIGTERM, shutting down"),
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
	let _ = tokio::signal::ctrl_c().await;
	info!("received ctrl-c, shutting down");
}
