// ---------------------------------------------------------------------------
// Feed Orchestrator
// ---------------------------------------------------------------------------
//
// Owns one instance of every component and wires them together:
//
//   feed:        candidates -> light rank -> optimizer-batched scoring -> mix
//   engagement:  interaction -> scorer -> learning buffer (+ preference signal)
//   learning:    buffer -> parameter store, guarded by fault-tolerant sync
//
// Read paths degrade (empty feed, fallback score) instead of failing.
// Snapshot, rollback and manual sync propagate their errors.
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::checksum::fnv1a64;
use crate::community::{CommunityBucket, CommunityMetrics};
use crate::config::EngineConfig;
use crate::error::FeedError;
use crate::learning_buffer::{BufferStats, OnlineLearningBuffer, SampleInput, TrainingSample};
use crate::light_ranker::{FollowGraph, LightRanker};
use crate::local::{HeuristicModel, InMemoryFollowGraph, LocalParameterStore};
use crate::lock;
use crate::mixer::{MixRequest, MixedResult, MixerStats, TimelineMixer};
use crate::optimizer::{HealthReport, HealthStatus, OptimizerStats, PerformanceOptimizer};
use crate::personalization::{
	DwellSignal, ExperimentProvider, FollowSignal, MixingStrategy, PersonalizationService,
	PersonalizationStats, PreferenceSignal, SignalTarget, UserPreferenceProfile,
};
use crate::sync::{
	FaultTolerantSync, ParameterSnapshot, ParameterStore, SnapshotInfo, SyncOperation, SyncServiceStatus,
};
use crate::types::{Candidate, EngagementType, FeatureMap, now_ms};

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// The viewer a feature vector is computed for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserContext {
	pub user_id: String,
	pub following: HashSet<String>,
}

/// Feature extraction and engagement prediction, typically a model server.
#[async_trait]
pub trait EngagementModel: Send + Sync {
	async fn extract_features(
		&self,
		candidate: &Candidate,
		user: &UserContext,
		prefs: Option<&UserPreferenceProfile>,
	) -> Result<FeatureMap, FeedError>;

	async fn predict(&self, features: &FeatureMap) -> Result<f64, FeedError>;
}

pub struct Collaborators {
	pub model: Arc<dyn EngagementModel>,
	pub follow_graph: Arc<dyn FollowGraph>,
	pub store: Arc<dyn ParameterStore>,
	pub experiments: Option<Arc<dyn ExperimentProvider>>,
}

// ---------------------------------------------------------------------------
// Requests & reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementRecord {
	pub user_id: String,
	pub content_id: String,
	pub engagement_type: EngagementType,
	#[serde(default)]
	pub features: FeatureMap,
	#[serde(default)]
	pub session_id: Option<String>,
	#[serde(default)]
	pub device_type: Option<String>,
	/// Author and topics of the content, used for the implied preference
	/// signal.
	#[serde(default)]
	pub author_id: Option<String>,
	#[serde(default)]
	pub topics: Vec<String>,
	#[serde(default)]
	pub dwell_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedRequest {
	pub user_id: String,
	pub candidates: Vec<Candidate>,
	pub limit: Option<usize>,
	pub session_id: Option<String>,
	pub force_refresh: bool,
	pub include_replies: bool,
	pub strategy: Option<MixingStrategy>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
	#[serde(flatten)]
	pub mixed: Option<MixedResult>,
	/// Candidates supplied by the caller, before light ranking.
	pub input_count: usize,
	pub light_ranked: usize,
	pub relaxed: bool,
	pub scored: usize,
	pub degraded_scores: usize,
	pub degraded: bool,
}

impl FeedResponse {
	fn empty(input_count: usize) -> Self {
		Self {
			mixed: None,
			input_count,
			light_ranked: 0,
			relaxed: false,
			scored: 0,
			degraded_scores: 0,
			degraded: true,
		}
	}

	pub fn content_ids(&self) -> &[String] {
		self.mixed.as_ref().map(|m| m.content_ids.as_slice()).unwrap_or(&[])
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
	pub status: HealthStatus,
	pub healthy: bool,
	pub issues: Vec<String>,
	pub optimizer: HealthReport,
	pub sync: SyncServiceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
	pub uptime_ms: u64,
	pub community_bucket: CommunityBucket,
	pub feeds_generated: u64,
	pub predictions: u64,
	pub degraded_predictions: u64,
	pub engagements_recorded: u64,
	pub buffer: BufferStats,
	pub optimizer: OptimizerStats,
	pub sync: SyncServiceStatus,
	pub personalization: PersonalizationStats,
	pub mixer: MixerStats,
}

#[derive(Default)]
struct Counters {
	feeds_generated: AtomicU64,
	predictions: AtomicU64,
	degraded_predictions: AtomicU64,
	engagements_recorded: AtomicU64,
}

// ---------------------------------------------------------------------------
// FeedOrchestrator
// ---------------------------------------------------------------------------

pub struct FeedOrchestrator {
	buffer: Arc<Mutex<OnlineLearningBuffer>>,
	light_ranker: LightRanker,
	optimizer: PerformanceOptimizer<f64>,
	sync: FaultTolerantSync,
	personalization: Arc<PersonalizationService>,
	mixer: TimelineMixer,
	model: Arc<dyn EngagementModel>,
	counters: Counters,
	started_at: u64,
	destroyed: AtomicBool,
}

/// Handles to the in-process collaborators built by
/// [`FeedOrchestrator::local`].
pub struct LocalParts {
	pub store: Arc<LocalParameterStore>,
	pub follow_graph: Arc<InMemoryFollowGraph>,
}

impl FeedOrchestrator {
	/// Build every component from `config` around the given collaborators.
	/// `buffer` is shared with the parameter store when that store learns
	/// from it.
	pub fn new(
		config: &EngineConfig,
		buffer: Arc<Mutex<OnlineLearningBuffer>>,
		collaborators: Collaborators,
	) -> Result<Self, FeedError> {
		let bucket = CommunityBucket::from_active_users(config.initial_active_users);
		lock(&buffer).set_community_bucket(bucket);
		let personalization = Arc::new(PersonalizationService::new(
			config.personalization.clone(),
			collaborators.experiments,
		));
		let sync = FaultTolerantSync::new(collaborators.store, config.sync.clone())?;
		sync.set_community_bucket(bucket);
		Ok(Self {
			buffer,
			light_ranker: LightRanker::new(config.light_rank.clone(), collaborators.follow_graph),
			optimizer: PerformanceOptimizer::new(config.optimizer.clone(), bucket),
			sync,
			mixer: TimelineMixer::new(config.mixer.clone(), Arc::clone(&personalization)),
			personalization,
			model: collaborators.model,
			counters: Counters::default(),
			started_at: now_ms(),
			destroyed: AtomicBool::new(false),
		})
	}

	/// Self-contained engine: local parameter store, heuristic model and
	/// in-memory follow graph.
	pub fn local(config: &EngineConfig) -> Result<(Self, LocalParts), FeedError> {
		let buffer = Arc::new(Mutex::new(OnlineLearningBuffer::new(config.buffer.clone())));
		let store = Arc::new(LocalParameterStore::new(Arc::clone(&buffer), config.local_store.clone()));
		let follow_graph = Arc::new(InMemoryFollowGraph::new());
		let orchestrator = Self::new(
			config,
			buffer,
			Collaborators {
				model: Arc::new(HeuristicModel::new(Arc::clone(&store))),
				follow_graph: follow_graph.clone(),
				store: store.clone(),
				experiments: None,
			},
		)?;
		Ok((orchestrator, LocalParts { store, follow_graph }))
	}

	/// Start every background loop.
	pub fn start(&self) {
		self.optimizer.start();
		self.sync.start();
		self.mixer.start();
		tracing::info!(bucket = ?self.community_bucket(), "Feed orchestrator started");
	}

	pub fn community_bucket(&self) -> CommunityBucket {
		self.optimizer.community_bucket()
	}

	pub fn personalization(&self) -> &PersonalizationService {
		&self.personalization
	}

	fn is_destroyed(&self) -> bool {
		self.destroyed.load(Ordering::SeqCst)
	}

	// -- features & prediction ------------------------------------------------

	/// Model features for one candidate; an empty map if extraction fails.
	pub async fn extract_features(
		&self,
		candidate: &Candidate,
		user: &UserContext,
		prefs: Option<&UserPreferenceProfile>,
	) -> FeatureMap {
		match self.model.extract_features(candidate, user, prefs).await {
			Ok(features) => features,
			Err(e) => {
				tracing::warn!(content_id = %candidate.id, error = %e, "Feature extraction failed");
				FeatureMap::new()
			}
		}
	}

	/// Predicted engagement in [0, 1], cached and batched through the
	/// optimizer. Falls back to `fallback` when prediction fails.
	pub async fn predict_engagement(&self, features: FeatureMap, fallback: f64) -> f64 {
		match self.try_predict(features).await {
			Ok(score) => score,
			Err(e) => {
				tracing::warn!(error = %e, fallback, "Engagement prediction failed; using fallback");
				fallback
			}
		}
	}

	async fn try_predict(&self, features: FeatureMap) -> Result<f64, FeedError> {
		self.counters.predictions.fetch_add(1, Ordering::Relaxed);
		let cache_key = serde_json::to_vec(&features)
			.ok()
			.map(|bytes| format!("predict:{:016x}", fnv1a64(&bytes)));
		let id = cache_key.clone().unwrap_or_else(|| "predict".to_string());
		let model = Arc::clone(&self.model);
		let result = self
			.optimizer
			.process_request(id, async move { model.predict(&features).await }, cache_key)
			.await;
		if result.is_err() {
			self.counters.degraded_predictions.fetch_add(1, Ordering::Relaxed);
		}
		result
	}

	// -- engagement -----------------------------------------------------------

	/// Score and buffer an interaction, and forward the implied preference
	/// signal.
	pub fn record_engagement(&self, record: EngagementRecord) -> TrainingSample {
		self.counters.engagements_recorded.fetch_add(1, Ordering::Relaxed);
		let signal = implied_signal(&record);
		let user_id = record.user_id.clone();
		let sample = lock(&self.buffer).add_sample(SampleInput {
			user_id: record.user_id,
			features: record.features,
			engagement_type: record.engagement_type,
			content_id: record.content_id,
			session_id: record.session_id,
			device_type: record.device_type,
			timestamp: None,
		});
		if let Some(signal) = signal {
			self.personalization.update_user_preferences(&user_id, &signal);
		}
		sample
	}

	/// Re-derive the community bucket and reconfigure every component that
	/// depends on it. Returns the active bucket.
	pub fn update_community_metrics(&self, metrics: &CommunityMetrics) -> CommunityBucket {
		let bucket = metrics.bucket();
		lock(&self.buffer).set_community_bucket(bucket);
		self.sync.set_community_bucket(bucket);
		if self.optimizer.update_community_bucket(bucket) {
			tracing::info!(
				bucket = ?bucket,
				active_users = metrics.active_users,
				"Community bucket updated"
			);
		}
		bucket
	}

	// -- feed -----------------------------------------------------------------

	pub async fn generate_feed(&self, request: FeedRequest) -> FeedResponse {
		let input_count = request.candidates.len();
		if self.is_destroyed() {
			return FeedResponse::empty(input_count);
		}
		self.counters.feeds_generated.fetch_add(1, Ordering::Relaxed);
		let user_id = request.user_id.as_str();

		let following = self.light_ranker.followees(user_id).await;
		let ranked = self.light_ranker.rank(request.candidates, &following);

		let user = UserContext {
			user_id: user_id.to_string(),
			following,
		};
		let prefs = self.personalization.get_user_profile(user_id);
		let light_ranked = ranked.candidates.len();
		let scored_futures = ranked.candidates.into_iter().map(|candidate| {
			let (user, prefs) = (&user, &prefs);
			async move {
				let features = self.extract_features(&candidate, user, Some(prefs)).await;
				if features.is_empty() {
					return (candidate, true);
				}
				match self.try_predict(features).await {
					Ok(score) => {
						let mut candidate = candidate;
						candidate.score = Some(score);
						(candidate, false)
					}
					Err(e) => {
						tracing::debug!(content_id = %candidate.id, error = %e, "Keeping light score");
						(candidate, true)
					}
				}
			}
		});
		let scored: Vec<(Candidate, bool)> = futures::future::join_all(scored_futures).await;
		let degraded_scores = scored.iter().filter(|(_, d)| *d).count();
		let candidates: Vec<Candidate> = scored.into_iter().map(|(c, _)| c).collect();

		let mixed = self
			.mixer
			.generate_mixed_timeline(
				candidates,
				&MixRequest {
					user_id: user.user_id.clone(),
					limit: request.limit,
					session_id: request.session_id,
					force_refresh: request.force_refresh,
					include_replies: request.include_replies,
					strategy: request.strategy,
					following: user.following,
				},
			)
			.await;

		FeedResponse {
			mixed: Some(mixed),
			input_count,
			light_ranked,
			relaxed: ranked.relaxed,
			scored: light_ranked - degraded_scores,
			degraded_scores,
			degraded: light_ranked > 0 && degraded_scores == light_ranked,
		}
	}

	// -- health & stats -------------------------------------------------------

	pub fn get_service_health(&self) -> ServiceHealth {
		let optimizer = self.optimizer.health_check();
		let sync = self.sync.status();
		let mut issues = optimizer.issues.clone();
		if !sync.healthy {
			issues.push(format!("{} consecutive sync failures", sync.consecutive_failures));
		}
		if self.is_destroyed() {
			issues.push("Service has been destroyed".to_string());
		}
		let status = if self.is_destroyed() || !sync.healthy {
			HealthStatus::Unhealthy
		} else {
			optimizer.status
		};
		ServiceHealth {
			status,
			healthy: status == HealthStatus::Healthy,
			issues,
			optimizer,
			sync,
		}
	}

	pub fn get_service_stats(&self) -> ServiceStats {
		ServiceStats {
			uptime_ms: now_ms().saturating_sub(self.started_at),
			community_bucket: self.community_bucket(),
			feeds_generated: self.counters.feeds_generated.load(Ordering::Relaxed),
			predictions: self.counters.predictions.load(Ordering::Relaxed),
			degraded_predictions: self.counters.degraded_predictions.load(Ordering::Relaxed),
			engagements_recorded: self.counters.engagements_recorded.load(Ordering::Relaxed),
			buffer: lock(&self.buffer).stats(),
			optimizer: self.optimizer.stats(),
			sync: self.sync.status(),
			personalization: self.personalization.stats(),
			mixer: self.mixer.stats(),
		}
	}

	// -- sync & snapshots -----------------------------------------------------

	pub async fn perform_manual_sync(&self) -> Result<SyncOperation, FeedError> {
		self.sync.perform_incremental_sync().await
	}

	pub async fn perform_full_sync(&self) -> Result<SyncOperation, FeedError> {
		self.sync.perform_full_sync().await
	}

	pub async fn create_snapshot(&self, description: Option<String>) -> Result<ParameterSnapshot, FeedError> {
		self.sync.create_snapshot(description).await
	}

	pub async fn rollback_to(&self, snapshot_id: &str) -> Result<SyncOperation, FeedError> {
		self.sync.rollback_to(snapshot_id).await
	}

	pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
		self.sync.snapshot_infos()
	}

	pub fn sync_history(&self) -> Vec<SyncOperation> {
		self.sync.history()
	}

	/// Stop background loops, drain pending batches and release state.
	/// Idempotent.
	pub async fn destroy(&self) {
		if self.destroyed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.optimizer.shutdown().await;
		self.sync.shutdown().await;
		self.mixer.shutdown().await;
		tracing::info!("Feed orchestrator destroyed");
	}
}

/// Preference signal implied by an interaction, if any.
fn implied_signal(record: &EngagementRecord) -> Option<PreferenceSignal> {
	let target = SignalTarget {
		content_id: Some(record.content_id.clone()),
		author_id: record.author_id.clone(),
		topics: record.topics.clone(),
		content_type: None,
	};
	match record.engagement_type {
		EngagementType::Like
		| EngagementType::Reaction
		| EngagementType::Bookmark
		| EngagementType::Reply
		| EngagementType::Renote
		| EngagementType::Share => Some(PreferenceSignal::Like(target)),
		EngagementType::Follow => record.author_id.clone().map(|author_id| PreferenceSignal::Follow(FollowSignal { author_id })),
		EngagementType::Dwell => record
			.dwell_ms
			.or_else(|| record.features.get("dwellMs").copied())
			.map(|dwell_ms| PreferenceSignal::Dwell(DwellSignal { target, dwell_ms })),
		EngagementType::View | EngagementType::Click => None,
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;

	fn orchestrator() -> (FeedOrchestrator, LocalParts) {
		FeedOrchestrator::local(&EngineConfig::default()).unwrap()
	}

	fn candidates(n: usize) -> Vec<Candidate> {
		let now = now_ms();
		(0..n)
			.map(|i| Candidate {
				id: format!("n{i}"),
				author_id: format!("a{}", i % 25),
				created_at: now - (i as u64 * 60_000),
				reaction_count: (i % 7) as u64,
				author_followers: 100 * (i % 10) as u64,
				..Default::default()
			})
			.collect()
	}

	fn record(user: &str, kind: EngagementType) -> EngagementRecord {
		EngagementRecord {
			user_id: user.into(),
			content_id: "n1".into(),
			engagement_type: kind,
			features: FeatureMap::new(),
			session_id: None,
			device_type: None,
			author_id: Some("a1".into()),
			topics: vec!["rust".into()],
			dwell_ms: None,
		}
	}

	struct FailingModel;

	#[async_trait]
	impl EngagementModel for FailingModel {
		async fn extract_features(
			&self,
			_candidate: &Candidate,
			_user: &UserContext,
			_prefs: Option<&UserPreferenceProfile>,
		) -> Result<FeatureMap, FeedError> {
			let mut f = FeatureMap::new();
			f.insert("x".into(), 1.0);
			Ok(f)
		}

		async fn predict(&self, _features: &FeatureMap) -> Result<f64, FeedError> {
			Err(FeedError::Operation("model offline".into()))
		}
	}

	#[tokio::test]
	async fn generates_bounded_feed() {
		let (orch, parts) = orchestrator();
		parts.follow_graph.follow("viewer", "a3");
		let response = orch
			.generate_feed(FeedRequest {
				user_id: "viewer".into(),
				candidates: candidates(200),
				limit: Some(20),
				..Default::default()
			})
			.await;
		assert_eq!(response.input_count, 200);
		assert!(response.light_ranked >= 50);
		assert_eq!(response.content_ids().len(), 20);
		assert!(!response.degraded);
		let unique: HashSet<&String> = response.content_ids().iter().collect();
		assert_eq!(unique.len(), 20);
		assert_eq!(orch.get_service_stats().feeds_generated, 1);
		orch.destroy().await;
	}

	#[tokio::test]
	async fn prediction_failures_degrade_to_light_scores() {
		let buffer = Arc::new(Mutex::new(OnlineLearningBuffer::new(Default::default())));
		let store = Arc::new(LocalParameterStore::new(Arc::clone(&buffer), Default::default()));
		let orch = FeedOrchestrator::new(
			&EngineConfig::default(),
			buffer,
			Collaborators {
				model: Arc::new(FailingModel),
				follow_graph: Arc::new(InMemoryFollowGraph::new()),
				store,
				experiments: None,
			},
		)
		.unwrap();
		let response = orch
			.generate_feed(FeedRequest {
				user_id: "u".into(),
				candidates: candidates(30),
				limit: Some(10),
				..Default::default()
			})
			.await;
		assert!(!response.content_ids().is_empty());
		assert_eq!(response.degraded_scores, response.light_ranked);
		assert!(response.degraded);
		assert_eq!(orch.predict_engagement(FeatureMap::new(), 0.25).await, 0.25);
	}

	#[tokio::test]
	async fn engagement_feeds_buffer_and_preferences() {
		let (orch, _) = orchestrator();
		let sample = orch.record_engagement(record("u1", EngagementType::Like));
		assert!(sample.weight >= 0.0);
		orch.record_engagement(record("u1", EngagementType::View));
		let stats = orch.get_service_stats();
		assert_eq!(stats.buffer.size, 2);
		assert_eq!(stats.engagements_recorded, 2);
		let profile = orch.personalization().get_user_profile("u1");
		assert_eq!(profile.signal_count, 1);
		assert!(profile.author_affinity("a1") > 0.0);
	}

	#[test]
	fn follow_and_dwell_imply_signals() {
		assert!(matches!(
			implied_signal(&record("u", EngagementType::Follow)),
			Some(PreferenceSignal::Follow(_))
		));
		let mut dwell = record("u", EngagementType::Dwell);
		assert!(implied_signal(&dwell).is_none());
		dwell.dwell_ms = Some(4_000.0);
		assert!(matches!(implied_signal(&dwell), Some(PreferenceSignal::Dwell(_))));
		assert!(implied_signal(&record("u", EngagementType::Click)).is_none());
	}

	#[tokio::test]
	async fn community_update_reconfigures_components() {
		let (orch, _) = orchestrator();
		assert_eq!(orch.community_bucket(), CommunityBucket::Small);
		let bucket = orch.update_community_metrics(&CommunityMetrics {
			active_users: 25_000,
			total_users: 100_000,
			posts_per_day: 9_000,
		});
		assert_eq!(bucket, CommunityBucket::Massive);
		let stats = orch.get_service_stats();
		assert_eq!(stats.community_bucket, CommunityBucket::Massive);
		assert_eq!(stats.buffer.community_bucket, CommunityBucket::Massive);
		assert_eq!(stats.optimizer.batch.batch_size, 50);
	}

	#[tokio::test]
	async fn manual_sync_and_snapshots() {
		let (orch, _) = orchestrator();
		for _ in 0..5 {
			orch.record_engagement(record("u1", EngagementType::Reply));
		}
		let op = orch.perform_manual_sync().await.unwrap();
		assert_eq!(op.status, crate::sync::SyncStatus::Success);
		let snap = orch.create_snapshot(Some("checkpoint".into())).await.unwrap();
		assert!(orch.list_snapshots().iter().any(|s| s.id == snap.id));
		let rollback = orch.rollback_to(&snap.id).await.unwrap();
		assert_eq!(rollback.rollback_target_id.as_deref(), Some(snap.id.as_str()));
		assert!(orch.get_service_health().sync.healthy);
	}

	#[tokio::test]
	async fn destroyed_orchestrator_degrades() {
		let (orch, _) = orchestrator();
		orch.start();
		orch.destroy().await;
		orch.destroy().await;
		let response = orch
			.generate_feed(FeedRequest {
				user_id: "u".into(),
				candidates: candidates(5),
				..Default::default()
			})
			.await;
		assert!(response.content_ids().is_empty());
		assert!(response.degraded);
		assert!(!orch.get_service_health().healthy);
		assert!(orch.perform_manual_sync().await.is_err());
	}
}
