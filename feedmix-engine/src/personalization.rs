// ---------------------------------------------------------------------------
// Personalization Service
// ---------------------------------------------------------------------------
//
// Per-user preference profiles nudged by feedback signals, and per-user
// algorithm configuration derived from deterministic experiment bucketing.
// An optional `ExperimentProvider` can override the hashed assignment.
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::TtlCache;
use crate::checksum::fnv1a64_parts;
use crate::community::{CacheConfig, EvictionPolicy};
use crate::error::FeedError;
use crate::lock;
use crate::types::now_ms;

const LIKE_STEP: f64 = 0.05;
const SKIP_STEP: f64 = -0.05;
const HIDE_STEP: f64 = -0.2;
const FOLLOW_STEP: f64 = 0.3;
const LONG_DWELL_STEP: f64 = 0.02;
const CONFIDENCE_STEP: f64 = 0.001;

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferenceProfile {
	pub user_id: String,
	pub topic_affinities: BTreeMap<String, f64>,
	pub author_affinities: BTreeMap<String, f64>,
	pub content_type_affinities: BTreeMap<String, f64>,
	pub diversity_tolerance: f64,
	pub freshness_weight: f64,
	pub quality_threshold: f64,
	pub avg_dwell_ms: f64,
	pub likes: u64,
	pub skips: u64,
	pub hides: u64,
	/// Grows toward 1 with every signal.
	pub confidence: f64,
	pub signal_count: u64,
	pub version: u64,
	pub updated_at: u64,
}

impl UserPreferenceProfile {
	pub fn new(user_id: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			topic_affinities: BTreeMap::new(),
			author_affinities: BTreeMap::new(),
			content_type_affinities: BTreeMap::new(),
			diversity_tolerance: 0.5,
			freshness_weight: 0.5,
			quality_threshold: 0.3,
			avg_dwell_ms: 0.0,
			likes: 0,
			skips: 0,
			hides: 0,
			confidence: 0.0,
			signal_count: 0,
			version: 0,
			updated_at: 0,
		}
	}

	pub fn author_affinity(&self, author_id: &str) -> f64 {
		self.author_affinities.get(author_id).copied().unwrap_or(0.0)
	}

	/// Mean affinity over the given topics; 0 when none are known.
	pub fn topic_affinity<'a>(&self, topics: impl IntoIterator<Item = &'a String>) -> f64 {
		let (sum, n) = topics
			.into_iter()
			.filter_map(|t| self.topic_affinities.get(t))
			.fold((0.0, 0usize), |(s, n), a| (s + a, n + 1));
		if n == 0 { 0.0 } else { sum / n as f64 }
	}

	/// Fraction of explicit feedback that was positive.
	pub fn engagement_rate(&self) -> f64 {
		let total = self.likes + self.skips + self.hides;
		if total == 0 {
			0.0
		} else {
			self.likes as f64 / total as f64
		}
	}
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalTarget {
	pub content_id: Option<String>,
	pub author_id: Option<String>,
	pub topics: Vec<String>,
	pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowSignal {
	pub author_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DwellSignal {
	#[serde(flatten)]
	pub target: SignalTarget,
	pub dwell_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PreferenceSignal {
	Like(SignalTarget),
	Skip(SignalTarget),
	Hide(SignalTarget),
	Follow(FollowSignal),
	Dwell(DwellSignal),
}

// ---------------------------------------------------------------------------
// Algorithm configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixingStrategy {
	Diversity,
	Relevance,
	Serendipity,
	Quality,
	Chronological,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmWeights {
	pub relevance: f64,
	pub freshness: f64,
	pub diversity: f64,
	pub quality: f64,
	pub social: f64,
	pub serendipity: f64,
}

impl Default for AlgorithmWeights {
	fn default() -> Self {
		Self::for_profile(WeightProfile::Balanced)
	}
}

impl AlgorithmWeights {
	pub fn for_profile(profile: WeightProfile) -> Self {
		let (relevance, freshness, diversity, quality, social, serendipity) = match profile {
			WeightProfile::Balanced => (0.35, 0.2, 0.2, 0.15, 0.1, 0.1),
			WeightProfile::Fresh => (0.25, 0.4, 0.15, 0.1, 0.1, 0.1),
			WeightProfile::Social => (0.25, 0.15, 0.15, 0.1, 0.35, 0.1),
			WeightProfile::Quality => (0.3, 0.1, 0.15, 0.4, 0.05, 0.05),
		};
		Self {
			relevance,
			freshness,
			diversity,
			quality,
			social,
			serendipity,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightProfile {
	Balanced,
	Fresh,
	Social,
	Quality,
}

impl WeightProfile {
	pub const ALL: [WeightProfile; 4] = [Self::Balanced, Self::Fresh, Self::Social, Self::Quality];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Balanced => "balanced",
			Self::Fresh => "fresh",
			Self::Social => "social",
			Self::Quality => "quality",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
	Lenient,
	Standard,
	Strict,
}

impl Strictness {
	pub const ALL: [Strictness; 3] = [Self::Lenient, Self::Standard, Self::Strict];

	/// Minimum score the quality strategy admits before backfill.
	pub fn quality_floor(self) -> f64 {
		match self {
			Self::Lenient => 0.0,
			Self::Standard => 0.1,
			Self::Strict => 0.2,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Lenient => "lenient",
			Self::Standard => "standard",
			Self::Strict => "strict",
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
	pub serendipity: bool,
	pub strictness: Strictness,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAlgorithmConfig {
	pub user_id: String,
	pub weights: AlgorithmWeights,
	pub features: FeatureFlags,
	/// Strategy pinned by an experiment, if any.
	pub strategy: Option<MixingStrategy>,
	/// Experiment name to arm.
	pub experiment_groups: BTreeMap<String, String>,
	pub assigned_at: u64,
}

/// Externally supplied membership for one user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentAssignment {
	pub groups: BTreeMap<String, String>,
	pub weights: Option<AlgorithmWeights>,
	pub strategy: Option<MixingStrategy>,
	pub serendipity: Option<bool>,
}

/// Experiment-assignment service. `Ok(None)` means the user is in no
/// externally managed experiment.
#[async_trait]
pub trait ExperimentProvider: Send + Sync {
	async fn assignment(&self, user_id: &str) -> Result<Option<ExperimentAssignment>, FeedError>;
}

// ---------------------------------------------------------------------------
// Deterministic bucketing
// ---------------------------------------------------------------------------

pub const WEIGHT_EXPERIMENT: &str = "weight-profile";
pub const STRICTNESS_EXPERIMENT: &str = "strictness";
pub const SERENDIPITY_EXPERIMENT: &str = "serendipity";

/// Stable arm index for `(experiment, user)`.
pub fn bucket_index(experiment: &str, user_id: &str, arms: usize) -> usize {
	(fnv1a64_parts(&[experiment, user_id]) % arms.max(1) as u64) as usize
}

/// Hash-only configuration for a user.
pub fn hashed_config(user_id: &str, now: u64) -> UserAlgorithmConfig {
	let profile = WeightProfile::ALL[bucket_index(WEIGHT_EXPERIMENT, user_id, WeightProfile::ALL.len())];
	let strictness = Strictness::ALL[bucket_index(STRICTNESS_EXPERIMENT, user_id, Strictness::ALL.len())];
	let serendipity = bucket_index(SERENDIPITY_EXPERIMENT, user_id, 2) == 1;

	let mut groups = BTreeMap::new();
	groups.insert(WEIGHT_EXPERIMENT.to_string(), profile.as_str().to_string());
	groups.insert(STRICTNESS_EXPERIMENT.to_string(), strictness.as_str().to_string());
	groups.insert(
		SERENDIPITY_EXPERIMENT.to_string(),
		if serendipity { "on" } else { "off" }.to_string(),
	);

	UserAlgorithmConfig {
		user_id: user_id.to_string(),
		weights: AlgorithmWeights::for_profile(profile),
		features: FeatureFlags { serendipity, strictness },
		strategy: None,
		experiment_groups: groups,
		assigned_at: now,
	}
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersonalizationOptions {
	/// Lifetime of a read view of a profile. Profiles themselves are kept
	/// until evicted by `max_profiles`.
	pub profile_ttl_ms: u64,
	/// Profiles retained; the least recently touched user is evicted first.
	pub max_profiles: usize,
	pub max_configs: usize,
	pub max_affinities: usize,
	pub dwell_alpha: f64,
	pub long_dwell_ms: f64,
}

impl Default for PersonalizationOptions {
	fn default() -> Self {
		Self {
			profile_ttl_ms: 300_000,
			max_profiles: 10_000,
			max_configs: 10_000,
			max_affinities: 500,
			dwell_alpha: 0.1,
			long_dwell_ms: 10_000.0,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalizationStats {
	pub tracked_profiles: usize,
	pub cached_profiles: usize,
	pub cached_configs: usize,
	pub evicted_profiles: u64,
	pub signals_processed: u64,
	pub provider_failures: u64,
}

/// Authoritative profile map, bounded by least-recent touch.
#[derive(Default)]
struct ProfileStore {
	entries: HashMap<String, (UserPreferenceProfile, u64)>,
	clock: u64,
}

impl ProfileStore {
	fn touch(&mut self, user_id: &str) -> Option<&mut UserPreferenceProfile> {
		self.clock += 1;
		let clock = self.clock;
		self.entries.get_mut(user_id).map(|(profile, touched)| {
			*touched = clock;
			profile
		})
	}

	/// Insert a new user, evicting the stalest one when full. Returns the
	/// evicted user id.
	fn admit(&mut self, profile: UserPreferenceProfile, cap: usize) -> Option<String> {
		let mut evicted = None;
		if !self.entries.contains_key(&profile.user_id) && self.entries.len() >= cap.max(1) {
			evicted = self
				.entries
				.iter()
				.min_by_key(|(_, (_, touched))| *touched)
				.map(|(k, _)| k.clone());
			if let Some(stalest) = &evicted {
				self.entries.remove(stalest);
			}
		}
		self.clock += 1;
		self.entries.insert(profile.user_id.clone(), (profile, self.clock));
		evicted
	}
}

pub struct PersonalizationService {
	options: PersonalizationOptions,
	provider: Option<Arc<dyn ExperimentProvider>>,
	// Lock order: `profiles` before `views`.
	profiles: Mutex<ProfileStore>,
	views: Mutex<TtlCache<UserPreferenceProfile>>,
	configs: Mutex<HashMap<String, UserAlgorithmConfig>>,
	evicted_profiles: AtomicU64,
	signals_processed: AtomicU64,
	provider_failures: AtomicU64,
}

impl PersonalizationService {
	pub fn new(options: PersonalizationOptions, provider: Option<Arc<dyn ExperimentProvider>>) -> Self {
		let views = TtlCache::new(&CacheConfig {
			max_size: options.max_profiles,
			ttl: Duration::from_millis(options.profile_ttl_ms),
			eviction: EvictionPolicy::Lru,
		});
		Self {
			options,
			provider,
			profiles: Mutex::new(ProfileStore::default()),
			views: Mutex::new(views),
			configs: Mutex::new(HashMap::new()),
			evicted_profiles: AtomicU64::new(0),
			signals_processed: AtomicU64::new(0),
			provider_failures: AtomicU64::new(0),
		}
	}

	/// Current profile, or defaults for an unknown user.
	pub fn get_user_profile(&self, user_id: &str) -> UserPreferenceProfile {
		if let Some(view) = lock(&self.views).get(user_id) {
			return view;
		}
		let mut profiles = lock(&self.profiles);
		match profiles.touch(user_id) {
			Some(profile) => {
				let profile = profile.clone();
				lock(&self.views).put(user_id, profile.clone());
				profile
			}
			None => UserPreferenceProfile::new(user_id),
		}
	}

	/// Apply one feedback signal and return the updated profile.
	pub fn update_user_preferences(&self, user_id: &str, signal: &PreferenceSignal) -> UserPreferenceProfile {
		let mut profiles = lock(&self.profiles);
		if profiles.touch(user_id).is_none() {
			let evicted = profiles.admit(UserPreferenceProfile::new(user_id), self.options.max_profiles);
			if let Some(evicted) = evicted {
				lock(&self.views).remove(&evicted);
				self.evicted_profiles.fetch_add(1, Ordering::Relaxed);
				tracing::debug!(user_id = %evicted, "Evicted least recently used preference profile");
			}
		}
		let Some(profile) = profiles.touch(user_id) else {
			return UserPreferenceProfile::new(user_id);
		};
		apply_signal(profile, signal, &self.options);
		profile.confidence = (profile.confidence + CONFIDENCE_STEP).min(1.0);
		profile.signal_count += 1;
		profile.version += 1;
		profile.updated_at = now_ms();
		let profile = profile.clone();
		lock(&self.views).put(user_id, profile.clone());
		drop(profiles);
		self.signals_processed.fetch_add(1, Ordering::Relaxed);
		tracing::trace!(user_id, version = profile.version, "Preference profile updated");
		profile
	}

	/// Algorithm configuration for a user. Assigned once and cached until
	/// `invalidate_user_config`.
	pub async fn get_user_config(&self, user_id: &str) -> UserAlgorithmConfig {
		if let Some(config) = lock(&self.configs).get(user_id) {
			return config.clone();
		}

		let mut config = hashed_config(user_id, now_ms());
		if let Some(provider) = &self.provider {
			match provider.assignment(user_id).await {
				Ok(Some(assignment)) => apply_assignment(&mut config, assignment),
				Ok(None) => {}
				Err(e) => {
					self.provider_failures.fetch_add(1, Ordering::Relaxed);
					tracing::warn!(user_id, error = %e, "Experiment provider failed; using hashed assignment");
				}
			}
		}

		let mut configs = lock(&self.configs);
		// Another caller may have assigned while the provider was awaited.
		if let Some(existing) = configs.get(user_id) {
			return existing.clone();
		}
		if configs.len() >= self.options.max_configs.max(1) {
			let oldest = configs
				.iter()
				.min_by_key(|(_, c)| c.assigned_at)
				.map(|(k, _)| k.clone());
			if let Some(oldest) = oldest {
				configs.remove(&oldest);
			}
		}
		configs.insert(user_id.to_string(), config.clone());
		config
	}

	pub fn invalidate_user_config(&self, user_id: &str) -> bool {
		lock(&self.configs).remove(user_id).is_some()
	}

	pub fn stats(&self) -> PersonalizationStats {
		PersonalizationStats {
			tracked_profiles: lock(&self.profiles).entries.len(),
			cached_profiles: lock(&self.views).len(),
			cached_configs: lock(&self.configs).len(),
			evicted_profiles: self.evicted_profiles.load(Ordering::Relaxed),
			signals_processed: self.signals_processed.load(Ordering::Relaxed),
			provider_failures: self.provider_failures.load(Ordering::Relaxed),
		}
	}
}

fn apply_assignment(config: &mut UserAlgorithmConfig, assignment: ExperimentAssignment) {
	config.experiment_groups.extend(assignment.groups);
	if let Some(weights) = assignment.weights {
		config.weights = weights;
	}
	if let Some(serendipity) = assignment.serendipity {
		config.features.serendipity = serendipity;
	}
	config.strategy = assignment.strategy;
}

fn nudge(map: &mut BTreeMap<String, f64>, key: &str, step: f64, cap: usize) {
	let value = map.entry(key.to_lowercase()).or_insert(0.0);
	*value = (*value + step).clamp(-1.0, 1.0);
	if map.len() > cap.max(1) {
		let weakest = map
			.iter()
			.min_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap_or(std::cmp::Ordering::Equal))
			.map(|(k, _)| k.clone());
		if let Some(weakest) = weakest {
			map.remove(&weakest);
		}
	}
}

fn nudge_target(profile: &mut UserPreferenceProfile, target: &SignalTarget, step: f64, cap: usize) {
	for topic in &target.topics {
		nudge(&mut profile.topic_affinities, topic, step, cap);
	}
	if let Some(author) = &target.author_id {
		nudge(&mut profile.author_affinities, author, step, cap);
	}
	if let Some(kind) = &target.content_type {
		nudge(&mut profile.content_type_affinities, kind, step, cap);
	}
}

fn apply_signal(profile: &mut UserPreferenceProfile, signal: &PreferenceSignal, options: &PersonalizationOptions) {
	let cap = options.max_affinities;
	match signal {
		PreferenceSignal::Like(target) => {
			profile.likes += 1;
			nudge_target(profile, target, LIKE_STEP, cap);
		}
		PreferenceSignal::Skip(target) => {
			profile.skips += 1;
			nudge_target(profile, target, SKIP_STEP, cap);
			profile.diversity_tolerance = (profile.diversity_tolerance + 0.01).min(1.0);
		}
		PreferenceSignal::Hide(target) => {
			profile.hides += 1;
			nudge_target(profile, target, HIDE_STEP, cap);
			profile.quality_threshold = (profile.quality_threshold + 0.02).min(0.9);
		}
		PreferenceSignal::Follow(follow) => {
			nudge(&mut profile.author_affinities, &follow.author_id, FOLLOW_STEP, cap);
		}
		PreferenceSignal::Dwell(dwell) => {
			let alpha = options.dwell_alpha;
			profile.avg_dwell_ms = if profile.avg_dwell_ms == 0.0 {
				dwell.dwell_ms
			} else {
				alpha * dwell.dwell_ms + (1.0 - alpha) * profile.avg_dwell_ms
			};
			if dwell.dwell_ms >= options.long_dwell_ms {
				for topic in &dwell.target.topics {
					nudge(&mut profile.topic_affinities, topic, LONG_DWELL_STEP, cap);
				}
			}
		}
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
