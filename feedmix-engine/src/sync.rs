// ---------------------------------------------------------------------------
// Fault-Tolerant Sync
// ---------------------------------------------------------------------------
//
// Wraps a `ParameterStore` with snapshotting, retry, post-sync health
// verification and automatic rollback:
//
//   perform_incremental_sync
//     pre-sync snapshot
//     attempt 1..=max_attempts: store sync, then health check
//       (store healthy, memory under ceiling, duration under ceiling)
//       failure: back off base * 2^(n-1), capped
//     exhausted: Failed operation, consecutive_failures += 1
//       threshold reached (auto-rollback on): roll back to the newest
//       snapshot older than consecutive_failures minutes
//
// Sync and rollback runs are serialized by an async gate. Bookkeeping state
// sits behind a std mutex that is never held across an await.
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::checksum::checksum_hex;
use crate::community::CommunityBucket;
use crate::error::FeedError;
use crate::lock;
use crate::snapshot_archive::SnapshotArchive;
use crate::tasks::TaskGroup;
use crate::types::now_ms;

const MINUTE_MS: u64 = 60_000;

// ---------------------------------------------------------------------------
// Parameter store seam
// ---------------------------------------------------------------------------

/// Learned state captured by a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParameterState {
	pub version: u64,
	pub model_parameters: BTreeMap<String, f64>,
	pub embedding_stats: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSyncStats {
	pub healthy: bool,
	pub memory_usage_mb: f64,
	pub total_samples: u64,
	pub pending_updates: u64,
	pub last_sync_at: Option<u64>,
}

/// The learning system whose parameters are synchronized and protected.
#[async_trait]
pub trait ParameterStore: Send + Sync {
	async fn get_parameters(&self) -> Result<ParameterState, FeedError>;

	/// Fold pending learning into the parameters. Returns how many
	/// parameters changed.
	async fn perform_incremental_sync(&self) -> Result<usize, FeedError>;

	/// Rebuild parameters from all retained learning. Stores without a
	/// cheaper incremental path can leave the default.
	async fn perform_full_sync(&self) -> Result<usize, FeedError> {
		self.perform_incremental_sync().await
	}

	async fn get_sync_stats(&self) -> Result<StoreSyncStats, FeedError>;

	async fn restore_parameters(&self, state: &ParameterState) -> Result<(), FeedError>;
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
	pub community_size: CommunityBucket,
	pub total_samples: u64,
	pub creator: String,
	pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSnapshot {
	pub id: String,
	pub timestamp: u64,
	pub version: u64,
	pub model_parameters: BTreeMap<String, f64>,
	pub embedding_stats: BTreeMap<String, f64>,
	pub sync_stats: StoreSyncStats,
	pub checksum: String,
	pub metadata: SnapshotMetadata,
}

/// Hashed view of a snapshot's content; the checksum covers exactly this.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChecksumInput<'a> {
	model_parameters: &'a BTreeMap<String, f64>,
	embedding_stats: &'a BTreeMap<String, f64>,
	sync_stats: &'a StoreSyncStats,
}

impl ParameterSnapshot {
	pub fn capture(
		timestamp: u64,
		state: ParameterState,
		sync_stats: StoreSyncStats,
		metadata: SnapshotMetadata,
	) -> Result<Self, FeedError> {
		let mut snapshot = Self {
			id: format!("snap-{timestamp}-{}", uuid::Uuid::new_v4().simple()),
			timestamp,
			version: state.version,
			model_parameters: state.model_parameters,
			embedding_stats: state.embedding_stats,
			sync_stats,
			checksum: String::new(),
			metadata,
		};
		snapshot.checksum = snapshot.compute_checksum()?;
		Ok(snapshot)
	}

	/// FNV-1a over the canonical JSON of parameters, embedding stats and
	/// sync stats. Maps are ordered, so the encoding is deterministic.
	pub fn compute_checksum(&self) -> Result<String, FeedError> {
		let bytes = serde_json::to_vec(&ChecksumInput {
			model_parameters: &self.model_parameters,
			embedding_stats: &self.embedding_stats,
			sync_stats: &self.sync_stats,
		})?;
		Ok(checksum_hex(&bytes))
	}

	pub fn verify(&self) -> Result<(), FeedError> {
		let actual = self.compute_checksum()?;
		if actual != self.checksum {
			return Err(FeedError::ChecksumMismatch {
				snapshot_id: self.id.clone(),
				expected: self.checksum.clone(),
				actual,
			});
		}
		Ok(())
	}

	pub fn parameter_state(&self) -> ParameterState {
		ParameterState {
			version: self.version,
			model_parameters: self.model_parameters.clone(),
			embedding_stats: self.embedding_stats.clone(),
		}
	}

	pub fn info(&self) -> SnapshotInfo {
		SnapshotInfo {
			id: self.id.clone(),
			timestamp: self.timestamp,
			version: self.version,
			checksum: self.checksum.clone(),
			parameter_count: self.model_parameters.len(),
			metadata: self.metadata.clone(),
		}
	}
}

/// Snapshot listing entry without the parameter payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
	pub id: String,
	pub timestamp: u64,
	pub version: u64,
	pub checksum: String,
	pub parameter_count: usize,
	pub metadata: SnapshotMetadata,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
	Incremental,
	Full,
	Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
	Pending,
	Success,
	Failed,
	/// A failed sync whose damage was undone by the rollback that followed.
	RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
	pub id: String,
	pub timestamp: u64,
	pub kind: SyncKind,
	pub status: SyncStatus,
	pub parameters_changed: usize,
	pub duration_ms: u64,
	pub attempts: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rollback_target_id: Option<String>,
}

impl SyncOperation {
	fn begin(kind: SyncKind) -> Self {
		Self {
			id: uuid::Uuid::new_v4().to_string(),
			timestamp: now_ms(),
			kind,
			status: SyncStatus::Pending,
			parameters_changed: 0,
			duration_ms: 0,
			attempts: 0,
			error: None,
			rollback_target_id: None,
		}
	}

	fn finish(mut self, status: SyncStatus, started: Instant) -> Self {
		self.status = status;
		self.duration_ms = started.elapsed().as_millis() as u64;
		self
	}

	fn fail(mut self, error: &FeedError, started: Instant) -> Self {
		self.error = Some(error.to_string());
		self.finish(SyncStatus::Failed, started)
	}
}

// ---------------------------------------------------------------------------
// Options & status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
	pub max_attempts: u32,
	pub base_backoff_ms: u64,
	pub max_backoff_ms: u64,
	pub max_memory_mb: f64,
	pub max_duration_ms: u64,
	pub rollback_threshold: u32,
	pub auto_rollback: bool,
	pub snapshot_retention: usize,
	pub snapshot_interval_ms: u64,
	/// Run incremental syncs on a timer when set.
	pub sync_interval_ms: Option<u64>,
	pub history_cap: usize,
	pub snapshot_dir: Option<PathBuf>,
}

impl Default for SyncOptions {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_backoff_ms: 1_000,
			max_backoff_ms: 30_000,
			max_memory_mb: 1_024.0,
			max_duration_ms: 30_000,
			rollback_threshold: 5,
			auto_rollback: true,
			snapshot_retention: 7,
			snapshot_interval_ms: 3_600_000,
			sync_interval_ms: None,
			history_cap: 1_000,
			snapshot_dir: None,
		}
	}
}

impl SyncOptions {
	/// Delay before retrying after `attempt` (1-based) failed.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
		Duration::from_millis(self.base_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncServiceStatus {
	pub healthy: bool,
	pub consecutive_failures: u32,
	pub total_syncs: u64,
	pub successful_syncs: u64,
	pub failed_syncs: u64,
	pub rollbacks: u64,
	pub last_success_at: Option<u64>,
	pub snapshot_count: usize,
	pub latest_snapshot_id: Option<String>,
	pub history_len: usize,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SyncState {
	/// Oldest first.
	snapshots: Vec<ParameterSnapshot>,
	history: VecDeque<SyncOperation>,
	consecutive_failures: u32,
	total_syncs: u64,
	successful_syncs: u64,
	failed_syncs: u64,
	rollbacks: u64,
	last_success_at: Option<u64>,
	bucket: CommunityBucket,
	shut_down: bool,
}

struct SyncInner {
	store: Arc<dyn ParameterStore>,
	options: SyncOptions,
	archive: Option<SnapshotArchive>,
	state: Mutex<SyncState>,
	gate: tokio::sync::Mutex<()>,
	tasks: TaskGroup,
}

impl SyncInner {
	fn push_history(&self, op: SyncOperation) {
		let mut st = lock(&self.state);
		st.history.push_back(op);
		while st.history.len() > self.options.history_cap.max(1) {
			st.history.pop_front();
		}
	}

	/// Add a snapshot and prune beyond retention, never dropping `protect`.
	fn insert_snapshot(&self, snapshot: ParameterSnapshot, protect: Option<&str>) {
		let pruned = {
			let mut st = lock(&self.state);
			let pos = st.snapshots.partition_point(|s| s.timestamp <= snapshot.timestamp);
			st.snapshots.insert(pos, snapshot);
			let mut pruned = Vec::new();
			let retention = self.options.snapshot_retention.max(1);
			let mut i = 0;
			while st.snapshots.len() > retention && i < st.snapshots.len() {
				if Some(st.snapshots[i].id.as_str()) == protect {
					i += 1;
					continue;
				}
				pruned.push(st.snapshots.remove(i).id);
			}
			pruned
		};
		if let Some(archive) = &self.archive {
			for id in &pruned {
				if let Err(e) = archive.remove(id) {
					tracing::warn!(snapshot_id = %id, error = %e, "Failed to delete pruned snapshot");
				}
			}
		}
		if !pruned.is_empty() {
			tracing::debug!(pruned = pruned.len(), "Pruned snapshots beyond retention");
		}
	}

	async fn take_snapshot(
		&self,
		creator: &str,
		description: Option<String>,
		protect: Option<&str>,
	) -> Result<ParameterSnapshot, FeedError> {
		let state = self.store.get_parameters().await?;
		let stats = self.store.get_sync_stats().await?;
		let bucket = lock(&self.state).bucket;
		let snapshot = ParameterSnapshot::capture(
			now_ms(),
			state,
			stats.clone(),
			SnapshotMetadata {
				community_size: bucket,
				total_samples: stats.total_samples,
				creator: creator.to_string(),
				description,
			},
		)?;
		if let Some(archive) = &self.archive {
			archive.save(&snapshot.id, &snapshot)?;
		}
		self.insert_snapshot(snapshot.clone(), protect);
		tracing::debug!(snapshot_id = %snapshot.id, creator, version = snapshot.version, "Snapshot created");
		Ok(snapshot)
	}

	/// One sync attempt followed by the post-sync health check.
	async fn attempt(&self, kind: SyncKind) -> Result<usize, FeedError> {
		let started = Instant::now();
		let changed = match kind {
			SyncKind::Full => self.store.perform_full_sync().await?,
			_ => self.store.perform_incremental_sync().await?,
		};
		let stats = self.store.get_sync_stats().await?;
		let elapsed_ms = started.elapsed().as_millis() as u64;
		if !stats.healthy {
			return Err(FeedError::HealthCheckFailed("parameter store reports unhealthy".into()));
		}
		if stats.memory_usage_mb > self.options.max_memory_mb {
			return Err(FeedError::HealthCheckFailed(format!(
				"memory {:.1}MB exceeds ceiling {:.1}MB",
				stats.memory_usage_mb, self.options.max_memory_mb
			)));
		}
		if elapsed_ms > self.options.max_duration_ms {
			return Err(FeedError::HealthCheckFailed(format!(
				"sync took {elapsed_ms}ms, ceiling {}ms",
				self.options.max_duration_ms
			)));
		}
		Ok(changed)
	}

	/// Verify, take a safety snapshot, restore. Returns the terminal
	/// rollback operation; the caller records it.
	async fn rollback(&self, target_id: &str, reason: &str) -> Result<SyncOperation, (SyncOperation, FeedError)> {
		let started = Instant::now();
		let mut op = SyncOperation::begin(SyncKind::Rollback);
		op.attempts = 1;
		op.rollback_target_id = Some(target_id.to_string());

		let target = lock(&self.state).snapshots.iter().find(|s| s.id == target_id).cloned();
		let Some(target) = target else {
			let e = FeedError::SnapshotNotFound(target_id.to_string());
			return Err((op.fail(&e, started), e));
		};
		if let Err(e) = target.verify() {
			tracing::error!(snapshot_id = %target.id, error = %e, "Rollback target failed verification");
			return Err((op.fail(&e, started), e));
		}
		if let Err(e) = self
			.take_snapshot("pre-rollback", Some(format!("Safety snapshot before rollback to {target_id}")), Some(target_id))
			.await
		{
			tracing::error!(error = %e, "Safety snapshot failed; rollback aborted");
			return Err((op.fail(&e, started), e));
		}
		if let Err(e) = self.store.restore_parameters(&target.parameter_state()).await {
			tracing::error!(snapshot_id = %target.id, error = %e, "Parameter restore failed");
			return Err((op.fail(&e, started), e));
		}

		op.parameters_changed = target.model_parameters.len();
		{
			let mut st = lock(&self.state);
			st.consecutive_failures = 0;
			st.rollbacks += 1;
		}
		tracing::warn!(snapshot_id = %target.id, version = target.version, reason, "Rolled back parameters");
		Ok(op.finish(SyncStatus::Success, started))
	}

	/// Roll back to the newest snapshot older than `failures` minutes.
	async fn auto_rollback(&self, failures: u32) -> SyncOperation {
		let cutoff = now_ms().saturating_sub(u64::from(failures) * MINUTE_MS);
		let target = lock(&self.state)
			.snapshots
			.iter()
			.rev()
			.find(|s| s.timestamp < cutoff)
			.map(|s| s.id.clone());
		match target {
			Some(id) => match self.rollback(&id, "auto-rollback after consecutive sync failures").await {
				Ok(op) => op,
				Err((op, _)) => op,
			},
			None => {
				let e = FeedError::NoRollbackTarget(failures);
				tracing::error!(failures, "No snapshot old enough to roll back to");
				let mut op = SyncOperation::begin(SyncKind::Rollback);
				op.error = Some(e.to_string());
				op.status = SyncStatus::Failed;
				op
			}
		}
	}
}

// ---------------------------------------------------------------------------
// FaultTolerantSync
// ---------------------------------------------------------------------------

pub struct FaultTolerantSync {
	inner: Arc<SyncInner>,
}

impl Clone for FaultTolerantSync {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl FaultTolerantSync {
	/// Build the sync layer. With a snapshot directory configured, archived
	/// snapshots are reloaded and re-verified; bad ones are skipped.
	pub fn new(store: Arc<dyn ParameterStore>, options: SyncOptions) -> Result<Self, FeedError> {
		let archive = match &options.snapshot_dir {
			Some(dir) => Some(SnapshotArchive::open(dir)?),
			None => None,
		};
		let mut snapshots = Vec::new();
		if let Some(archive) = &archive {
			for (file_id, snapshot) in archive.load_all::<ParameterSnapshot>()? {
				if file_id != snapshot.id {
					tracing::warn!(file_id = %file_id, snapshot_id = %snapshot.id, "Archived snapshot id mismatch; skipping");
					continue;
				}
				match snapshot.verify() {
					Ok(()) => snapshots.push(snapshot),
					Err(e) => tracing::warn!(error = %e, "Archived snapshot failed verification; skipping"),
				}
			}
			snapshots.sort_by_key(|s| s.timestamp);
			tracing::info!(restored = snapshots.len(), dir = %archive.dir().display(), "Snapshot archive loaded");
		}

		let inner = Arc::new(SyncInner {
			store,
			options,
			archive,
			state: Mutex::new(SyncState::default()),
			gate: tokio::sync::Mutex::new(()),
			tasks: TaskGroup::new("sync"),
		});
		// Apply retention to whatever the archive held.
		for snapshot in snapshots {
			inner.insert_snapshot(snapshot, None);
		}
		Ok(Self { inner })
	}

	/// Start the periodic snapshot loop and, if configured, the periodic
	/// sync loop.
	pub fn start(&self) {
		let weak = Arc::downgrade(&self.inner);
		let period = Duration::from_millis(self.inner.options.snapshot_interval_ms);
		self.inner.tasks.spawn_periodic("snapshot", period, move || {
			let weak: Weak<SyncInner> = weak.clone();
			async move {
				let Some(inner) = weak.upgrade() else {
					return;
				};
				let _gate = inner.gate.lock().await;
				if let Err(e) = inner.take_snapshot("periodic", None, None).await {
					tracing::warn!(error = %e, "Periodic snapshot failed");
				}
			}
		});

		if let Some(ms) = self.inner.options.sync_interval_ms {
			let weak = Arc::downgrade(&self.inner);
			self.inner.tasks.spawn_periodic("sync", Duration::from_millis(ms), move || {
				let weak = weak.clone();
				async move {
					let Some(inner) = weak.upgrade() else {
						return;
					};
					let sync = FaultTolerantSync { inner };
					if let Err(e) = sync.perform_incremental_sync().await {
						tracing::warn!(error = %e, "Periodic sync failed");
					}
				}
			});
		}
		tracing::info!(
			snapshot_interval_ms = self.inner.options.snapshot_interval_ms,
			sync_interval_ms = ?self.inner.options.sync_interval_ms,
			"Fault-tolerant sync started"
		);
	}

	pub async fn perform_incremental_sync(&self) -> Result<SyncOperation, FeedError> {
		self.perform_sync(SyncKind::Incremental).await
	}

	/// Same retry, health and rollback handling as an incremental sync, but
	/// the store rebuilds from everything it retains.
	pub async fn perform_full_sync(&self) -> Result<SyncOperation, FeedError> {
		self.perform_sync(SyncKind::Full).await
	}

	async fn perform_sync(&self, kind: SyncKind) -> Result<SyncOperation, FeedError> {
		let inner = &self.inner;
		let _gate = inner.gate.lock().await;
		if lock(&inner.state).shut_down {
			return Err(FeedError::ShutDown);
		}
		let started = Instant::now();
		let mut op = SyncOperation::begin(kind);

		if let Err(e) = inner.take_snapshot("pre-sync", None, None).await {
			tracing::warn!(error = %e, "Pre-sync snapshot failed; continuing");
		}

		let max_attempts = inner.options.max_attempts.max(1);
		let mut last_error = None;
		for attempt in 1..=max_attempts {
			op.attempts = attempt;
			match inner.attempt(kind).await {
				Ok(changed) => {
					op.parameters_changed = changed;
					let op = op.finish(SyncStatus::Success, started);
					{
						let mut st = lock(&inner.state);
						st.total_syncs += 1;
						st.successful_syncs += 1;
						st.consecutive_failures = 0;
						st.last_success_at = Some(op.timestamp);
					}
					inner.push_history(op.clone());
					tracing::info!(?kind, changed, attempt, duration_ms = op.duration_ms, "Sync succeeded");
					return Ok(op);
				}
				Err(e) => {
					tracing::warn!(attempt, max_attempts, error = %e, "Sync attempt failed");
					last_error = Some(e);
					if attempt < max_attempts {
						tokio::time::sleep(inner.options.backoff(attempt)).await;
					}
				}
			}
		}

		let message = last_error.map(|e| e.to_string()).unwrap_or_default();
		let error = FeedError::SyncFailed {
			attempts: max_attempts,
			message,
		};
		let mut op = op.fail(&error, started);
		let failures = {
			let mut st = lock(&inner.state);
			st.total_syncs += 1;
			st.failed_syncs += 1;
			st.consecutive_failures += 1;
			st.consecutive_failures
		};
		tracing::error!(?kind, failures, error = %error, "Sync failed");

		let rollback = if inner.options.auto_rollback && failures >= inner.options.rollback_threshold {
			Some(inner.auto_rollback(failures).await)
		} else {
			None
		};
		if rollback.as_ref().is_some_and(|r| r.status == SyncStatus::Success) {
			op.status = SyncStatus::RolledBack;
		}
		inner.push_history(op);
		if let Some(rollback) = rollback {
			inner.push_history(rollback);
		}
		Err(error)
	}

	/// Roll back to a specific snapshot, with the same verification and
	/// safety snapshot as an automatic rollback.
	pub async fn rollback_to(&self, snapshot_id: &str) -> Result<SyncOperation, FeedError> {
		let _gate = self.inner.gate.lock().await;
		match self.inner.rollback(snapshot_id, "manual rollback").await {
			Ok(op) => {
				self.inner.push_history(op.clone());
				Ok(op)
			}
			Err((op, e)) => {
				self.inner.push_history(op);
				Err(e)
			}
		}
	}

	pub async fn create_snapshot(&self, description: Option<String>) -> Result<ParameterSnapshot, FeedError> {
		let _gate = self.inner.gate.lock().await;
		if lock(&self.inner.state).shut_down {
			return Err(FeedError::ShutDown);
		}
		self.inner.take_snapshot("manual", description, None).await
	}

	/// Adopt an externally produced snapshot (e.g. copied from another
	/// node). Rejected unless its checksum verifies.
	pub fn import_snapshot(&self, snapshot: ParameterSnapshot) -> Result<(), FeedError> {
		snapshot.verify()?;
		if let Some(archive) = &self.inner.archive {
			archive.save(&snapshot.id, &snapshot)?;
		}
		self.inner.insert_snapshot(snapshot, None);
		Ok(())
	}

	pub fn set_community_bucket(&self, bucket: CommunityBucket) {
		lock(&self.inner.state).bucket = bucket;
	}

	pub fn snapshots(&self) -> Vec<ParameterSnapshot> {
		lock(&self.inner.state).snapshots.clone()
	}

	pub fn snapshot_infos(&self) -> Vec<SnapshotInfo> {
		lock(&self.inner.state).snapshots.iter().map(ParameterSnapshot::info).collect()
	}

	pub fn history(&self) -> Vec<SyncOperation> {
		lock(&self.inner.state).history.iter().cloned().collect()
	}

	pub fn consecutive_failures(&self) -> u32 {
		lock(&self.inner.state).consecutive_failures
	}

	pub fn status(&self) -> SyncServiceStatus {
		let st = lock(&self.inner.state);
		SyncServiceStatus {
			healthy: st.consecutive_failures < self.inner.options.rollback_threshold,
			consecutive_failures: st.consecutive_failures,
			total_syncs: st.total_syncs,
			successful_syncs: st.successful_syncs,
			failed_syncs: st.failed_syncs,
			rollbacks: st.rollbacks,
			last_success_at: st.last_success_at,
			snapshot_count: st.snapshots.len(),
			latest_snapshot_id: st.snapshots.last().map(|s| s.id.clone()),
			history_len: st.history.len(),
		}
	}

	/// Stop background loops and wait for any running sync to finish.
	pub async fn shutdown(&self) {
		self.inner.tasks.shutdown().await;
		let _gate = self.inner.gate.lock().await;
		lock(&self.inner.state).shut_down = true;
		tracing::info!("Fault-tolerant sync shut down");
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	/// In-memory store with switchable failure modes.
	#[derive(Default)]
	struct FakeStore {
		params: Mutex<ParameterState>,
		fail_sync: AtomicBool,
		unhealthy: AtomicBool,
		memory_mb: Mutex<f64>,
		sync_calls: AtomicUsize,
		restores: AtomicUsize,
	}

	#[async_trait]
	impl ParameterStore for FakeStore {
		async fn get_parameters(&self) -> Result<ParameterState, FeedError> {
			Ok(lock(&self.params).clone())
		}

		async fn perform_incremental_sync(&self) -> Result<usize, FeedError> {
			self.sync_calls.fetch_add(1, Ordering::SeqCst);
			if self.fail_sync.load(Ordering::SeqCst) {
				return Err(FeedError::Store("sync exploded".into()));
			}
			let mut p = lock(&self.params);
			p.version += 1;
			let v = p.version as f64;
			p.model_parameters.insert("bias.like".into(), v);
			Ok(1)
		}

		async fn get_sync_stats(&self) -> Result<StoreSyncStats, FeedError> {
			Ok(StoreSyncStats {
				healthy: !self.unhealthy.load(Ordering::SeqCst),
				memory_usage_mb: *lock(&self.memory_mb),
				total_samples: 42,
				pending_updates: 0,
				last_sync_at: None,
			})
		}

		async fn restore_parameters(&self, state: &ParameterState) -> Result<(), FeedError> {
			self.restores.fetch_add(1, Ordering::SeqCst);
			*lock(&self.params) = state.clone();
			Ok(())
		}
	}

	fn sync_with(store: Arc<FakeStore>, options: SyncOptions) -> FaultTolerantSync {
		FaultTolerantSync::new(store, options).unwrap()
	}

	fn old_snapshot(age_ms: u64, weight: f64) -> ParameterSnapshot {
		let mut state = ParameterState {
			version: 1,
			..Default::default()
		};
		state.model_parameters.insert("bias.like".into(), weight);
		ParameterSnapshot::capture(
			now_ms() - age_ms,
			state,
			StoreSyncStats {
				healthy: true,
				..Default::default()
			},
			SnapshotMetadata {
				community_size: CommunityBucket::Small,
				total_samples: 10,
				creator: "test".into(),
				description: None,
			},
		)
		.unwrap()
	}

	// -- snapshots ------------------------------------------------------------

	#[test]
	fn checksum_recomputes_from_own_content() {
		let snap = old_snapshot(0, 0.5);
		assert_eq!(snap.compute_checksum().unwrap(), snap.checksum);
		assert!(snap.verify().is_ok());

		let json = serde_json::to_string(&snap).unwrap();
		let back: ParameterSnapshot = serde_json::from_str(&json).unwrap();
		assert!(back.verify().is_ok());
	}

	#[test]
	fn tampered_snapshot_fails_verification() {
		let mut snap = old_snapshot(0, 0.5);
		snap.model_parameters.insert("bias.like".into(), 9.0);
		let err = snap.verify().unwrap_err();
		assert_eq!(err.code(), "SNAPSHOT_CHECKSUM_MISMATCH");
	}

	#[test]
	fn backoff_doubles_and_caps() {
		let opts = SyncOptions::default();
		assert_eq!(opts.backoff(1), Duration::from_secs(1));
		assert_eq!(opts.backoff(2), Duration::from_secs(2));
		assert_eq!(opts.backoff(3), Duration::from_secs(4));
		assert_eq!(opts.backoff(10), Duration::from_secs(30));
	}

	#[tokio::test]
	async fn retention_keeps_newest() {
		let sync = sync_with(Arc::new(FakeStore::default()), SyncOptions {
			snapshot_retention: 3,
			..Default::default()
		});
		for i in 0..5 {
			sync.create_snapshot(Some(format!("s{i}"))).await.unwrap();
		}
		let snaps = sync.snapshots();
		assert_eq!(snaps.len(), 3);
		assert_eq!(snaps.last().unwrap().metadata.description.as_deref(), Some("s4"));
	}

	#[test]
	fn import_rejects_bad_checksum() {
		let sync = sync_with(Arc::new(FakeStore::default()), SyncOptions::default());
		let mut snap = old_snapshot(0, 0.1);
		snap.checksum = "0000000000000000".into();
		assert!(sync.import_snapshot(snap).is_err());
		assert!(sync.snapshots().is_empty());
	}

	// -- sync -----------------------------------------------------------------

	#[tokio::test]
	async fn successful_sync_records_operation() {
		let store = Arc::new(FakeStore::default());
		let sync = sync_with(Arc::clone(&store), SyncOptions::default());
		let op = sync.perform_incremental_sync().await.unwrap();
		assert_eq!(op.status, SyncStatus::Success);
		assert_eq!(op.kind, SyncKind::Incremental);
		assert_eq!(op.parameters_changed, 1);
		assert_eq!(op.attempts, 1);
		assert_eq!(sync.history().len(), 1);
		// Pre-sync snapshot.
		assert_eq!(sync.snapshots().len(), 1);
		assert_eq!(sync.status().successful_syncs, 1);
	}

	#[tokio::test]
	async fn full_sync_falls_back_to_incremental_store_path() {
		let store = Arc::new(FakeStore::default());
		let sync = sync_with(Arc::clone(&store), SyncOptions::default());
		let op = sync.perform_full_sync().await.unwrap();
		assert_eq!(op.kind, SyncKind::Full);
		assert_eq!(op.status, SyncStatus::Success);
		assert_eq!(store.sync_calls.load(Ordering::SeqCst), 1);
		assert_eq!(sync.history()[0].kind, SyncKind::Full);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_sync_retries_with_backoff() {
		let store = Arc::new(FakeStore::default());
		store.fail_sync.store(true, Ordering::SeqCst);
		let sync = sync_with(Arc::clone(&store), SyncOptions::default());

		let started = Instant::now();
		let err = sync.perform_incremental_sync().await.unwrap_err();
		assert_eq!(err.code(), "SYNC_FAILED");
		assert_eq!(store.sync_calls.load(Ordering::SeqCst), 3);
		assert!(started.elapsed() >= Duration::from_secs(3));
		assert_eq!(sync.consecutive_failures(), 1);
		let history = sync.history();
		assert_eq!(history.len(), 1);
		assert_eq!(history[0].status, SyncStatus::Failed);
		assert!(history[0].error.as_deref().unwrap().contains("sync exploded"));
	}

	#[tokio::test(start_paused = true)]
	async fn health_check_failures_count_as_failed_attempts() {
		let store = Arc::new(FakeStore::default());
		*lock(&store.memory_mb) = 4_096.0;
		let sync = sync_with(Arc::clone(&store), SyncOptions::default());
		let err = sync.perform_incremental_sync().await.unwrap_err();
		assert!(err.to_string().contains("memory"));

		*lock(&store.memory_mb) = 10.0;
		store.unhealthy.store(true, Ordering::SeqCst);
		let err = sync.perform_incremental_sync().await.unwrap_err();
		assert!(err.to_string().contains("unhealthy"));
		assert_eq!(sync.consecutive_failures(), 2);

		store.unhealthy.store(false, Ordering::SeqCst);
		sync.perform_incremental_sync().await.unwrap();
		assert_eq!(sync.consecutive_failures(), 0);
	}

	// -- rollback -------------------------------------------------------------

	#[tokio::test(start_paused = true)]
	async fn six_failures_trigger_exactly_one_rollback() {
		let store = Arc::new(FakeStore::default());
		store.fail_sync.store(true, Ordering::SeqCst);
		let sync = sync_with(Arc::clone(&store), SyncOptions::default());
		let target = old_snapshot(10 * MINUTE_MS, 0.75);
		let target_id = target.id.clone();
		sync.import_snapshot(target).unwrap();

		for _ in 0..6 {
			assert!(sync.perform_incremental_sync().await.is_err());
		}

		let history = sync.history();
		let rollbacks: Vec<&SyncOperation> = history.iter().filter(|op| op.kind == SyncKind::Rollback).collect();
		assert_eq!(rollbacks.len(), 1);
		assert_eq!(rollbacks[0].status, SyncStatus::Success);
		assert_eq!(rollbacks[0].rollback_target_id.as_deref(), Some(target_id.as_str()));
		assert_eq!(history.iter().filter(|op| op.status == SyncStatus::RolledBack).count(), 1);

		// Reset at the fifth failure; the sixth starts a new streak.
		assert_eq!(sync.consecutive_failures(), 1);
		assert_eq!(store.restores.load(Ordering::SeqCst), 1);
		assert_eq!(lock(&store.params).model_parameters.get("bias.like"), Some(&0.75));
		assert_eq!(sync.status().rollbacks, 1);
	}

	#[tokio::test(start_paused = true)]
	async fn rollback_without_old_snapshot_keeps_counter() {
		let store = Arc::new(FakeStore::default());
		store.fail_sync.store(true, Ordering::SeqCst);
		let sync = sync_with(Arc::clone(&store), SyncOptions {
			rollback_threshold: 2,
			..Default::default()
		});
		for _ in 0..2 {
			let _ = sync.perform_incremental_sync().await;
		}
		let history = sync.history();
		let rollback = history.last().unwrap();
		assert_eq!(rollback.kind, SyncKind::Rollback);
		assert_eq!(rollback.status, SyncStatus::Failed);
		assert!(rollback.error.as_deref().unwrap().contains("No rollback target"));
		assert_eq!(sync.consecutive_failures(), 2);
		assert_eq!(store.restores.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn manual_rollback_takes_safety_snapshot() {
		let store = Arc::new(FakeStore::default());
		let sync = sync_with(Arc::clone(&store), SyncOptions::default());
		let snap = sync.create_snapshot(Some("before".into())).await.unwrap();
		sync.perform_incremental_sync().await.unwrap();
		assert_eq!(lock(&store.params).version, 1);

		let op = sync.rollback_to(&snap.id).await.unwrap();
		assert_eq!(op.status, SyncStatus::Success);
		assert_eq!(lock(&store.params).version, 0);
		assert!(sync.snapshots().iter().any(|s| s.metadata.creator == "pre-rollback"));
	}

	#[tokio::test]
	async fn rollback_to_unknown_snapshot_is_recorded() {
		let sync = sync_with(Arc::new(FakeStore::default()), SyncOptions::default());
		let err = sync.rollback_to("missing").await.unwrap_err();
		assert_eq!(err.code(), "SNAPSHOT_NOT_FOUND");
		assert_eq!(sync.history()[0].status, SyncStatus::Failed);
	}

	// -- archive --------------------------------------------------------------

	#[tokio::test]
	async fn archived_snapshots_survive_restart() {
		let dir = tempfile::tempdir().unwrap();
		let options = SyncOptions {
			snapshot_dir: Some(dir.path().to_path_buf()),
			..Default::default()
		};
		let store = Arc::new(FakeStore::default());
		let first = sync_with(Arc::clone(&store), options.clone());
		let snap = first.create_snapshot(Some("persisted".into())).await.unwrap();
		first.shutdown().await;

		let second = sync_with(store, options);
		let restored = second.snapshots();
		assert_eq!(restored.len(), 1);
		assert_eq!(restored[0], snap);
	}

	#[tokio::test]
	async fn shutdown_rejects_new_syncs() {
		let sync = sync_with(Arc::new(FakeStore::default()), SyncOptions::default());
		sync.start();
		sync.shutdown().await;
		assert!(matches!(sync.perform_incremental_sync().await, Err(FeedError::ShutDown)));
	}
}
