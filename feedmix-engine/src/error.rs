use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
	#[error("Operation failed: {0}")]
	Operation(String),
	#[error("Sync failed after {attempts} attempt(s): {message}")]
	SyncFailed { attempts: u32, message: String },
	#[error("Post-sync health check failed: {0}")]
	HealthCheckFailed(String),
	#[error("Checksum mismatch for snapshot {snapshot_id}: expected {expected}, got {actual}")]
	ChecksumMismatch {
		snapshot_id: String,
		expected: String,
		actual: String,
	},
	#[error("Snapshot not found: {0}")]
	SnapshotNotFound(String),
	#[error("No rollback target older than {0} minute(s)")]
	NoRollbackTarget(u32),
	#[error("Batched operation was dropped before it completed")]
	BatchCancelled,
	#[error("Parameter store error: {0}")]
	Store(String),
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("Serialization error: {0}")]
	Serialization(String),
	#[error("Service is shut down")]
	ShutDown,
	#[error("Invalid params: {0}")]
	InvalidParams(String),
}

impl FeedError {
	pub fn code(&self) -> &str {
		match self {
			Self::Operation(_) => "FEED_OPERATION_FAILED",
			Self::SyncFailed { .. } => "SYNC_FAILED",
			Self::HealthCheckFailed(_) => "SYNC_HEALTH_CHECK_FAILED",
			Self::ChecksumMismatch { .. } => "SNAPSHOT_CHECKSUM_MISMATCH",
			Self::SnapshotNotFound(_) => "SNAPSHOT_NOT_FOUND",
			Self::NoRollbackTarget(_) => "NO_ROLLBACK_TARGET",
			Self::BatchCancelled => "BATCH_CANCELLED",
			Self::Store(_) => "PARAMETER_STORE_ERROR",
			Self::Io(_) => "FEED_IO",
			Self::Serialization(_) => "FEED_SERIALIZATION",
			Self::ShutDown => "FEED_SHUT_DOWN",
			Self::InvalidParams(_) => "FEED_INVALID_PARAMS",
		}
	}

	pub fn to_json_rpc_error(&self) -> serde_json::Value {
		serde_json::json!({
			"feedCode": self.code(),
			"message": self.to_string(),
		})
	}
}

impl From<serde_json::Error> for FeedError {
	fn from(e: serde_json::Error) -> Self {
		Self::Serialization(e.to_string())
	}
}
