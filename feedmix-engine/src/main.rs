use anyhow::Result;
use clap::Parser;
use feedmix_engine::config::{CliArgs, EngineConfig};
use feedmix_engine::orchestrator::FeedOrchestrator;
use feedmix_engine::server::FeedServer;
use feedmix_engine::transport::NdjsonTransport;

fn main() -> Result<()> {
	let args = CliArgs::parse();

	// Logs go to stderr; stdout carries the NDJSON protocol.
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
		)
		.init();

	let config = EngineConfig::from_cli(&args)?;
	let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
	let _enter = runtime.enter();

	let (orchestrator, parts) = FeedOrchestrator::local(&config)?;
	orchestrator.start();
	tracing::info!(
		bucket = ?orchestrator.community_bucket(),
		snapshot_dir = ?config.sync.snapshot_dir,
		"feedmix-engine ready"
	);

	let server = FeedServer::new(NdjsonTransport::stdout(), runtime.handle().clone(), orchestrator, parts.follow_graph);
	server.run()?;
	Ok(())
}
