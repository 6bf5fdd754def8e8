use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::FeedError;
use crate::learning_buffer::BufferOptions;
use crate::light_ranker::LightRankOptions;
use crate::local::LocalStoreOptions;
use crate::mixer::MixerOptions;
use crate::optimizer::OptimizerOptions;
use crate::personalization::PersonalizationOptions;
use crate::sync::SyncOptions;

#[derive(Parser, Debug, Clone)]
#[command(name = "feedmix-engine", about = "Feed ranking and timeline mixing engine over JSON-RPC / NDJSON stdio")]
pub struct CliArgs {
	/// JSON config file; missing file means defaults
	#[arg(long, env = "FEEDMIX_CONFIG")]
	pub config: Option<PathBuf>,

	/// Directory for archived parameter snapshots
	#[arg(long, env = "FEEDMIX_SNAPSHOT_DIR")]
	pub snapshot_dir: Option<PathBuf>,

	/// Archive snapshots under the user data directory when no
	/// snapshot directory is configured
	#[arg(long)]
	pub archive: bool,

	/// Online learning buffer capacity
	#[arg(long, env = "FEEDMIX_BUFFER_CAPACITY")]
	pub buffer_capacity: Option<usize>,

	/// Active users used to pick the initial community bucket
	#[arg(long, env = "FEEDMIX_ACTIVE_USERS")]
	pub active_users: Option<u64>,

	/// Log level (trace, debug, info, warn, error)
	#[arg(long, default_value = "info", env = "FEEDMIX_LOG_LEVEL")]
	pub log_level: String,
}

/// Complete engine configuration. Every field has a default, so a partial
/// JSON file only overrides what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
	pub buffer: BufferOptions,
	pub light_rank: LightRankOptions,
	pub optimizer: OptimizerOptions,
	pub sync: SyncOptions,
	pub mixer: MixerOptions,
	pub personalization: PersonalizationOptions,
	pub local_store: LocalStoreOptions,
	/// Starting community size; updated later via community metrics.
	pub initial_active_users: u64,
}

impl EngineConfig {
	pub fn load(path: &Path) -> Result<Self, FeedError> {
		if !path.exists() {
			tracing::info!(path = %path.display(), "Config file not found; using defaults");
			return Ok(Self::default());
		}
		let raw = std::fs::read(path)?;
		let config: Self = serde_json::from_slice(&raw)?;
		tracing::info!(path = %path.display(), "Config loaded");
		Ok(config)
	}

	/// Layer CLI overrides on top of the file configuration.
	pub fn apply_cli(&mut self, args: &CliArgs) {
		if let Some(dir) = &args.snapshot_dir {
			self.sync.snapshot_dir = Some(dir.clone());
		} else if args.archive && self.sync.snapshot_dir.is_none() {
			self.sync.snapshot_dir = default_snapshot_dir();
		}
		if let Some(capacity) = args.buffer_capacity {
			self.buffer.capacity = capacity;
		}
		if let Some(users) = args.active_users {
			self.initial_active_users = users;
		}
	}

	pub fn from_cli(args: &CliArgs) -> Result<Self, FeedError> {
		let mut config = match &args.config {
			Some(path) => Self::load(path)?,
			None => Self::default(),
		};
		config.apply_cli(args);
		Ok(config)
	}
}

/// `<data dir>/feedmix/snapshots`, when the platform has a data directory.
pub fn default_snapshot_dir() -> Option<PathBuf> {
	dirs::data_dir().map(|d| d.join("feedmix").join("snapshots"))
}
