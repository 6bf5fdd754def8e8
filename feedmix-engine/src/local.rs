// ---------------------------------------------------------------------------
// In-process collaborators
// ---------------------------------------------------------------------------
//
// Self-contained implementations of the external seams, so the engine runs
// without a model server or social graph service:
//
// - `LocalParameterStore` learns per-kind engagement biases and feature means
//   from the learning buffer's recent training batch.
// - `HeuristicModel` extracts ranking features and predicts engagement from
//   them, nudged by the learned biases.
// - `InMemoryFollowGraph` keeps followee sets in a map.
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::error::FeedError;
use crate::learning_buffer::OnlineLearningBuffer;
use crate::light_ranker::{
	FollowGraph, author_quality_component, content_bonus, recency_component, velocity_component,
};
use crate::lock;
use crate::orchestrator::{EngagementModel, UserContext};
use crate::personalization::UserPreferenceProfile;
use crate::sync::{ParameterState, ParameterStore, StoreSyncStats};
use crate::types::{Candidate, EngagementType, FeatureMap, now_ms};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const CHANGE_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// LocalParameterStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalStoreOptions {
	/// Most recent samples folded in per sync.
	pub batch_size: usize,
	pub learning_rate: f64,
	/// Rough per-sample footprint for the memory estimate.
	pub bytes_per_sample: usize,
}

impl Default for LocalStoreOptions {
	fn default() -> Self {
		Self {
			batch_size: 1_000,
			learning_rate: 0.2,
			bytes_per_sample: 1_024,
		}
	}
}

struct StoreState {
	params: ParameterState,
	last_sync_at: Option<u64>,
	synced_total: u64,
}

pub struct LocalParameterStore {
	buffer: Arc<Mutex<OnlineLearningBuffer>>,
	options: LocalStoreOptions,
	state: Mutex<StoreState>,
}

pub fn bias_key(kind: EngagementType) -> String {
	format!("bias.{}", kind.as_str())
}

impl LocalParameterStore {
	pub fn new(buffer: Arc<Mutex<OnlineLearningBuffer>>, options: LocalStoreOptions) -> Self {
		let mut params = ParameterState::default();
		for kind in EngagementType::ALL {
			params.model_parameters.insert(bias_key(kind), kind.base_score());
		}
		Self {
			buffer,
			options,
			state: Mutex::new(StoreState {
				params,
				last_sync_at: None,
				synced_total: 0,
			}),
		}
	}

	/// Learned mean engagement score for a kind.
	pub fn bias(&self, kind: EngagementType) -> f64 {
		lock(&self.state)
			.params
			.model_parameters
			.get(&bias_key(kind))
			.copied()
			.unwrap_or_else(|| kind.base_score())
	}

	pub fn version(&self) -> u64 {
		lock(&self.state).params.version
	}

	/// Fold up to `limit` recent samples into the parameters at rate `lr`.
	/// Returns how many parameters moved.
	fn learn(&self, limit: Option<usize>, lr: f64, now: u64) -> usize {
		let (batch, total_added) = {
			let buffer = lock(&self.buffer);
			let n = limit.unwrap_or_else(|| buffer.len());
			(buffer.training_batch(n, now), buffer.total_added())
		};

		// Weighted mean score per kind, weighted mean value per feature.
		let mut per_kind: HashMap<EngagementType, (f64, f64)> = HashMap::new();
		let mut per_feature: BTreeMap<String, (f64, f64)> = BTreeMap::new();
		for sample in &batch {
			let w = sample.weight;
			if w <= 0.0 {
				continue;
			}
			let entry = per_kind.entry(sample.engagement_type).or_insert((0.0, 0.0));
			entry.0 += w * sample.engagement_score;
			entry.1 += w;
			for (name, value) in &sample.features {
				let f = per_feature.entry(name.clone()).or_insert((0.0, 0.0));
				f.0 += w * value;
				f.1 += w;
			}
		}

		let lr = lr.clamp(0.0, 1.0);
		let mut st = lock(&self.state);
		let mut changed = 0;
		for (kind, (sum, weight)) in per_kind {
			let target = sum / weight;
			let param = st
				.params
				.model_parameters
				.entry(bias_key(kind))
				.or_insert_with(|| kind.base_score());
			let next = *param + lr * (target - *param);
			if (next - *param).abs() > CHANGE_EPSILON {
				*param = next;
				changed += 1;
			}
		}
		for (name, (sum, weight)) in per_feature {
			st.params.embedding_stats.insert(format!("mean.{name}"), sum / weight);
		}
		st.params
			.embedding_stats
			.insert("batchSize".to_string(), batch.len() as f64);
		if changed > 0 {
			st.params.version += 1;
		}
		st.last_sync_at = Some(now);
		st.synced_total = total_added;
		changed
	}
}

#[async_trait]
impl ParameterStore for LocalParameterStore {
	async fn get_parameters(&self) -> Result<ParameterState, FeedError> {
		Ok(lock(&self.state).params.clone())
	}

	async fn perform_incremental_sync(&self) -> Result<usize, FeedError> {
		let changed = self.learn(Some(self.options.batch_size), self.options.learning_rate, now_ms());
		tracing::debug!(changed, version = self.version(), "Local parameters updated");
		Ok(changed)
	}

	/// Refit every bias from the whole buffer.
	async fn perform_full_sync(&self) -> Result<usize, FeedError> {
		let changed = self.learn(None, 1.0, now_ms());
		tracing::debug!(changed, version = self.version(), "Local parameters refit");
		Ok(changed)
	}

	async fn get_sync_stats(&self) -> Result<StoreSyncStats, FeedError> {
		let (samples, total_added) = {
			let buffer = lock(&self.buffer);
			(buffer.len(), buffer.total_added())
		};
		let st = lock(&self.state);
		let healthy = st.params.model_parameters.values().all(|v| v.is_finite());
		let memory_bytes = samples as f64 * self.options.bytes_per_sample as f64
			+ (st.params.model_parameters.len() + st.params.embedding_stats.len()) as f64 * 64.0;
		Ok(StoreSyncStats {
			healthy,
			memory_usage_mb: memory_bytes / BYTES_PER_MB,
			total_samples: total_added,
			pending_updates: total_added.saturating_sub(st.synced_total),
			last_sync_at: st.last_sync_at,
		})
	}

	async fn restore_parameters(&self, state: &ParameterState) -> Result<(), FeedError> {
		if state.model_parameters.values().any(|v| !v.is_finite()) {
			return Err(FeedError::Store("refusing to restore non-finite parameters".into()));
		}
		lock(&self.state).params = state.clone();
		tracing::info!(version = state.version, "Local parameters restored");
		Ok(())
	}
}

// ---------------------------------------------------------------------------
// HeuristicModel
// ---------------------------------------------------------------------------

pub struct HeuristicModel {
	store: Arc<LocalParameterStore>,
}

impl HeuristicModel {
	pub fn new(store: Arc<LocalParameterStore>) -> Self {
		Self { store }
	}

	/// Learned prior in [0, 1]: how strongly active kinds score relative to
	/// their defaults.
	fn engagement_prior(&self) -> f64 {
		let kinds = [EngagementType::Like, EngagementType::Reply, EngagementType::Renote];
		let ratio: f64 = kinds
			.iter()
			.map(|k| self.store.bias(*k) / k.base_score())
			.sum::<f64>()
			/ kinds.len() as f64;
		(ratio / 2.0).clamp(0.0, 1.0)
	}
}

fn flag(value: bool) -> f64 {
	if value { 1.0 } else { 0.0 }
}

#[async_trait]
impl EngagementModel for HeuristicModel {
	async fn extract_features(
		&self,
		candidate: &Candidate,
		user: &UserContext,
		prefs: Option<&UserPreferenceProfile>,
	) -> Result<FeatureMap, FeedError> {
		let now = now_ms();
		let mut features = FeatureMap::new();
		features.insert("recency".into(), recency_component(candidate, now));
		features.insert("velocity".into(), velocity_component(candidate, now));
		features.insert("authorQuality".into(), author_quality_component(candidate));
		features.insert("contentBonus".into(), content_bonus(candidate));
		features.insert("followed".into(), flag(user.following.contains(&candidate.author_id)));
		features.insert("hasMedia".into(), flag(candidate.has_media));
		features.insert("isReply".into(), flag(candidate.is_reply()));
		features.insert("lightScore".into(), candidate.score.unwrap_or(0.0));
		if let Some(prefs) = prefs {
			features.insert("authorAffinity".into(), prefs.author_affinity(&candidate.author_id));
			features.insert("topicAffinity".into(), prefs.topic_affinity(&candidate.topics()));
			features.insert("freshnessWeight".into(), prefs.freshness_weight);
		}
		Ok(features)
	}

	async fn predict(&self, features: &FeatureMap) -> Result<f64, FeedError> {
		let f = |name: &str| features.get(name).copied().unwrap_or(0.0);
		if features.values().any(|v| !v.is_finite()) {
			return Err(FeedError::InvalidParams("non-finite feature value".into()));
		}
		let freshness = 0.15 * (0.5 + f("freshnessWeight")) * f("recency");
		let score = 0.30 * f("lightScore")
			+ freshness
			+ 0.20 * f("velocity")
			+ 0.10 * f("followed")
			+ 0.10 * f("authorAffinity")
			+ 0.05 * f("topicAffinity")
			+ 0.10 * self.engagement_prior();
		Ok(score.clamp(0.0, 1.0))
	}
}

// ---------------------------------------------------------------------------
// InMemoryFollowGraph
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryFollowGraph {
	edges: Mutex<HashMap<String, HashSet<String>>>,
}

impl InMemoryFollowGraph {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set_followees(&self, user_id: &str, followees: impl IntoIterator<Item = String>) {
		lock(&self.edges).insert(user_id.to_string(), followees.into_iter().collect());
	}

	pub fn follow(&self, user_id: &str, author_id: &str) {
		lock(&self.edges)
			.entry(user_id.to_string())
			.or_default()
			.insert(author_id.to_string());
	}
}

#[async_trait]
impl FollowGraph for InMemoryFollowGraph {
	async fn followees(&self, user_id: &str) -> Result<HashSet<String>, FeedError> {
		Ok(lock(&self.edges).get(user_id).cloned().unwrap_or_default())
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
