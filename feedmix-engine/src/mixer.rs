// ---------------------------------------------------------------------------
// Timeline Mixer
// ---------------------------------------------------------------------------
//
// Turns a scored candidate pool into one bounded, deduplicated, session-aware
// timeline page:
//
//   1. resolve the user's algorithm config and pick a strategy
//   2. resolve the session (a forced refresh mints a new one and clears the
//      user's history)
//   3. seeded reorder: 80% pseudorandom, 20% recency, one seed per time bucket
//   4. dedupe and drop replies the viewer is not party to
//   5. filter seen content, backfilling up to the minimum retention
//   6. author and self-post caps, overflow backfill up to the same floor
//   7. strategy ordering, truncate, record what was surfaced
// ---------------------------------------------------------------------------

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::TtlCache;
use crate::checksum::{fnv1a64, fnv1a64_parts};
use crate::community::{CacheConfig, EvictionPolicy};
use crate::lock;
use crate::personalization::{
	AlgorithmWeights, FeatureFlags, MixingStrategy, PersonalizationService, UserPreferenceProfile,
};
use crate::tasks::TaskGroup;
use crate::types::{Candidate, now_ms};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MixerOptions {
	pub random_weight: f64,
	pub recency_weight: f64,
	pub time_bucket_ms: u64,
	pub minimum_retention: f64,
	pub max_posts_per_author: usize,
	pub max_self_posts: usize,
	pub user_history_cap: usize,
	/// History length kept after the cap is exceeded.
	pub user_history_trim: usize,
	pub session_seen_cap: usize,
	pub session_ttl_ms: u64,
	pub freshness_ceiling_ms: u64,
	pub serendipity_following: usize,
	pub serendipity_discovery: usize,
	pub result_cache_ttl_ms: u64,
	pub result_cache_size: usize,
	pub cleanup_interval_ms: u64,
	pub max_tracked_users: usize,
	pub default_limit: usize,
}

impl Default for MixerOptions {
	fn default() -> Self {
		Self {
			random_weight: 0.8,
			recency_weight: 0.2,
			time_bucket_ms: 300_000,
			minimum_retention: 0.4,
			max_posts_per_author: 3,
			max_self_posts: 1,
			user_history_cap: 1_000,
			user_history_trim: 500,
			session_seen_cap: 1_000,
			session_ttl_ms: 1_800_000,
			freshness_ceiling_ms: 86_400_000,
			serendipity_following: 2,
			serendipity_discovery: 1,
			result_cache_ttl_ms: 30_000,
			result_cache_size: 1_000,
			cleanup_interval_ms: 300_000,
			max_tracked_users: 10_000,
			default_limit: 20,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MixRequest {
	pub user_id: String,
	pub limit: Option<usize>,
	pub session_id: Option<String>,
	pub force_refresh: bool,
	pub include_replies: bool,
	/// Overrides experiment and weight-based selection.
	pub strategy: Option<MixingStrategy>,
	/// Authors the viewer follows; drives the serendipity interleave.
	pub following: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixedResult {
	pub content_ids: Vec<String>,
	pub strategy: MixingStrategy,
	pub session_id: String,
	pub freshness_score: f64,
	pub diversity_score: f64,
	pub cache_hit: bool,
	pub processing_time_ms: f64,
	pub candidate_count: usize,
	pub eligible_count: usize,
	/// Seen ids known for this user and session before filtering.
	pub seen_before: usize,
	/// Items re-admitted (seen or over a cap) to honour minimum retention.
	pub backfilled: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerStats {
	pub active_sessions: usize,
	pub tracked_users: usize,
	pub total_mixes: u64,
	pub cache_hits: u64,
	pub forced_refreshes: u64,
	pub cached_results: usize,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Insertion-ordered set with a length bound.
#[derive(Debug, Default)]
struct SeenSet {
	ids: HashSet<String>,
	order: VecDeque<String>,
	last_active: Option<Instant>,
}

impl SeenSet {
	fn contains(&self, id: &str) -> bool {
		self.ids.contains(id)
	}

	fn len(&self) -> usize {
		self.ids.len()
	}

	fn insert(&mut self, id: &str) {
		if self.ids.insert(id.to_string()) {
			self.order.push_back(id.to_string());
		}
	}

	/// Once over `cap`, drop oldest entries down to `keep`.
	fn bound(&mut self, cap: usize, keep: usize) {
		if self.order.len() <= cap {
			return;
		}
		while self.order.len() > keep.min(cap) {
			if let Some(old) = self.order.pop_front() {
				self.ids.remove(&old);
			}
		}
	}
}

struct MixerState {
	sessions: HashMap<(String, String), SeenSet>,
	history: HashMap<String, SeenSet>,
	results: TtlCache<MixedResult>,
	total_mixes: u64,
	cache_hits: u64,
	forced_refreshes: u64,
}

struct MixerInner {
	options: MixerOptions,
	personalization: Arc<PersonalizationService>,
	state: Mutex<MixerState>,
	tasks: TaskGroup,
}

// ---------------------------------------------------------------------------
// TimelineMixer
// ---------------------------------------------------------------------------

pub struct TimelineMixer {
	inner: Arc<MixerInner>,
}

impl Clone for TimelineMixer {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl TimelineMixer {
	pub fn new(options: MixerOptions, personalization: Arc<PersonalizationService>) -> Self {
		let results = TtlCache::new(&CacheConfig {
			max_size: options.result_cache_size,
			ttl: Duration::from_millis(options.result_cache_ttl_ms),
			eviction: EvictionPolicy::Lru,
		});
		Self {
			inner: Arc::new(MixerInner {
				options,
				personalization,
				state: Mutex::new(MixerState {
					sessions: HashMap::new(),
					history: HashMap::new(),
					results,
					total_mixes: 0,
					cache_hits: 0,
					forced_refreshes: 0,
				}),
				tasks: TaskGroup::new("mixer"),
			}),
		}
	}

	pub fn options(&self) -> &MixerOptions {
		&self.inner.options
	}

	/// Start the idle-session cleanup loop.
	pub fn start(&self) {
		let weak = Arc::downgrade(&self.inner);
		let period = Duration::from_millis(self.inner.options.cleanup_interval_ms);
		self.inner.tasks.spawn_periodic("session-cleanup", period, move || {
			let weak = weak.clone();
			async move {
				if let Some(inner) = weak.upgrade() {
					TimelineMixer { inner }.cleanup_sessions();
				}
			}
		});
	}

	pub async fn shutdown(&self) {
		self.inner.tasks.shutdown().await;
		let mut st = lock(&self.inner.state);
		st.results.clear();
		tracing::info!(sessions = st.sessions.len(), "Timeline mixer shut down");
	}

	pub async fn generate_mixed_timeline(&self, candidates: Vec<Candidate>, request: &MixRequest) -> MixedResult {
		let started = Instant::now();
		let options = &self.inner.options;
		let user_id = request.user_id.as_str();
		let limit = request.limit.unwrap_or(options.default_limit);

		// The only suspension point; everything after it is one critical
		// section.
		let config = self.inner.personalization.get_user_config(user_id).await;
		let profile = self.inner.personalization.get_user_profile(user_id);
		let strategy = request
			.strategy
			.or(config.strategy)
			.unwrap_or_else(|| select_strategy(&config.weights, &config.features, &profile));

		let now = now_ms();
		let mut st = lock(&self.inner.state);
		st.total_mixes += 1;

		let (session_id, seed, fully_random) = if request.force_refresh {
			st.forced_refreshes += 1;
			let session_id = format!("{user_id}-{now}-{}", uuid::Uuid::new_v4().simple());
			st.history.remove(user_id);
			st.sessions.retain(|(u, _), _| u != user_id);
			tracing::debug!(user_id, session_id = %session_id, "Forced refresh; seen history cleared");
			(session_id, rand::rng().random::<u64>(), true)
		} else {
			let session_id = request
				.session_id
				.clone()
				.unwrap_or_else(|| format!("{user_id}:default"));
			let bucket = now / options.time_bucket_ms.max(1);
			(session_id, fnv1a64_parts(&[user_id, &bucket.to_string()]), false)
		};

		let cache_key = (!request.force_refresh).then(|| result_cache_key(request, &session_id, strategy, limit, now, options, &candidates));
		if let Some(key) = &cache_key {
			if let Some(mut hit) = st.results.get(key) {
				st.cache_hits += 1;
				hit.cache_hit = true;
				hit.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
				return hit;
			}
		}

		let candidate_count = candidates.len();
		let ordered = reorder(candidates, seed, now, options, fully_random);
		let eligible = eligible_candidates(ordered, user_id, request.include_replies);
		let eligible_count = eligible.len();
		let floor = retention_floor(eligible_count, limit, options.minimum_retention);

		let session_key = (user_id.to_string(), session_id.clone());
		let (unseen, mut backfilled, seen_before) = {
			let empty = SeenSet::default();
			let session = st.sessions.get(&session_key).unwrap_or(&empty);
			let history = st.history.get(user_id).unwrap_or(&empty);
			let seen_before = session.len() + history.ids.iter().filter(|id| !session.contains(id)).count();
			let (unseen, backfilled) = filter_seen(eligible, floor, |id| session.contains(id) || history.contains(id));
			(unseen, backfilled, seen_before)
		};

		let (capped, cap_backfill) = apply_caps(unseen, user_id, floor, options);
		backfilled += cap_backfill;

		let mut selected = apply_strategy(strategy, capped, &profile, &request.following, &config.features, options);
		selected.truncate(limit);

		let session = st.sessions.entry(session_key).or_default();
		for c in &selected {
			session.insert(&c.id);
		}
		session.last_active = Some(Instant::now());
		session.bound(options.session_seen_cap, options.session_seen_cap);
		record_history(&mut st, user_id, &selected, options);

		let result = MixedResult {
			content_ids: selected.iter().map(|c| c.id.clone()).collect(),
			strategy,
			session_id,
			freshness_score: freshness_score(&selected, now, options.freshness_ceiling_ms),
			diversity_score: diversity_score(&selected),
			cache_hit: false,
			processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
			candidate_count,
			eligible_count,
			seen_before,
			backfilled,
		};
		if let Some(key) = cache_key {
			st.results.put(key, result.clone());
		}
		tracing::debug!(
			user_id,
			strategy = ?strategy,
			returned = result.content_ids.len(),
			candidates = candidate_count,
			backfilled,
			"Timeline mixed"
		);
		result
	}

	/// Drop session seen-sets idle beyond the session TTL, plus expired
	/// cached results. Returns the number of sessions removed.
	pub fn cleanup_sessions(&self) -> usize {
		let ttl = Duration::from_millis(self.inner.options.session_ttl_ms);
		let now = Instant::now();
		let mut st = lock(&self.inner.state);
		let before = st.sessions.len();
		st.sessions.retain(|_, s| {
			s.last_active
				.is_some_and(|t| now.saturating_duration_since(t) < ttl)
		});
		let removed = before - st.sessions.len();
		let expired = st.results.purge_expired();
		if removed > 0 || expired > 0 {
			tracing::debug!(removed, expired, "Mixer sessions cleaned up");
		}
		removed
	}

	pub fn clear_user_history(&self, user_id: &str) {
		let mut st = lock(&self.inner.state);
		st.history.remove(user_id);
		st.sessions.retain(|(u, _), _| u != user_id);
	}

	pub fn stats(&self) -> MixerStats {
		let st = lock(&self.inner.state);
		MixerStats {
			active_sessions: st.sessions.len(),
			tracked_users: st.history.len(),
			total_mixes: st.total_mixes,
			cache_hits: st.cache_hits,
			forced_refreshes: st.forced_refreshes,
			cached_results: st.results.len(),
		}
	}
}

fn record_history(st: &mut MixerState, user_id: &str, selected: &[Candidate], options: &MixerOptions) {
	if !st.history.contains_key(user_id) && st.history.len() >= options.max_tracked_users.max(1) {
		let stalest = st
			.history
			.iter()
			.min_by_key(|(_, h)| h.last_active)
			.map(|(k, _)| k.clone());
		if let Some(stalest) = stalest {
			st.history.remove(&stalest);
		}
	}
	let history = st.history.entry(user_id.to_string()).or_default();
	for c in selected {
		history.insert(&c.id);
	}
	history.last_active = Some(Instant::now());
	history.bound(options.user_history_cap, options.user_history_trim);
}

fn result_cache_key(
	request: &MixRequest,
	session_id: &str,
	strategy: MixingStrategy,
	limit: usize,
	now: u64,
	options: &MixerOptions,
	candidates: &[Candidate],
) -> String {
	let mut ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
	ids.sort_unstable();
	let bucket = (now / options.time_bucket_ms.max(1)).to_string();
	let limit = limit.to_string();
	let strategy = format!("{strategy:?}");
	let replies = if request.include_replies { "r" } else { "-" };
	let digest = fnv1a64(ids.join("\u{1f}").as_bytes()).to_string();
	format!(
		"{:016x}",
		fnv1a64_parts(&[&request.user_id, session_id, &bucket, &strategy, &limit, replies, &digest])
	)
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

/// Weight-threshold strategy selection when no experiment pins one.
pub fn select_strategy(
	weights: &AlgorithmWeights,
	features: &FeatureFlags,
	profile: &UserPreferenceProfile,
) -> MixingStrategy {
	if features.serendipity {
		MixingStrategy::Serendipity
	} else if weights.quality >= 0.3 {
		MixingStrategy::Quality
	} else if weights.freshness >= 0.35 {
		MixingStrategy::Chronological
	} else if weights.social >= 0.3 || profile.confidence >= 0.5 {
		MixingStrategy::Relevance
	} else {
		MixingStrategy::Diversity
	}
}

/// Pseudorandom reorder. Each candidate draws from a generator seeded by
/// `seed` and its own id, so relative order is stable for one seed.
pub fn reorder(
	candidates: Vec<Candidate>,
	seed: u64,
	now: u64,
	options: &MixerOptions,
	fully_random: bool,
) -> Vec<Candidate> {
	let ceiling = options.freshness_ceiling_ms.max(1) as f64;
	let mut keyed: Vec<(f64, Candidate)> = candidates
		.into_iter()
		.map(|c| {
			let r: f64 = StdRng::seed_from_u64(seed ^ fnv1a64(c.id.as_bytes())).random();
			let key = if fully_random {
				r
			} else {
				let recency = (1.0 - c.age_ms(now) as f64 / ceiling).clamp(0.0, 1.0);
				options.random_weight * r + options.recency_weight * recency
			};
			(key, c)
		})
		.collect();
	keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
	keyed.into_iter().map(|(_, c)| c).collect()
}

/// Dedupe by id (first wins) and drop replies unless the viewer opted in or
/// is party to the reply.
pub fn eligible_candidates(candidates: Vec<Candidate>, viewer: &str, include_replies: bool) -> Vec<Candidate> {
	let mut seen = HashSet::new();
	candidates
		.into_iter()
		.filter(|c| seen.insert(c.id.clone()))
		.filter(|c| {
			!c.is_reply()
				|| include_replies
				|| c.author_id == viewer
				|| c.reply_author_id.as_deref() == Some(viewer)
		})
		.collect()
}

/// Output floor: `min(limit, ceil(retention * eligible))`.
pub fn retention_floor(eligible: usize, limit: usize, retention: f64) -> usize {
	let floor = (eligible as f64 * retention.clamp(0.0, 1.0)).ceil() as usize;
	floor.min(limit).min(eligible)
}

/// Keep unseen items; if fewer than `floor` remain, re-admit seen ones in
/// order until the floor is met. Returns the survivors and how many seen
/// items were re-admitted.
pub fn filter_seen(
	candidates: Vec<Candidate>,
	floor: usize,
	is_seen: impl Fn(&str) -> bool,
) -> (Vec<Candidate>, usize) {
	let (unseen, seen): (Vec<(usize, Candidate)>, Vec<(usize, Candidate)>) = candidates
		.into_iter()
		.enumerate()
		.partition(|(_, c)| !is_seen(&c.id));
	let deficit = floor.saturating_sub(unseen.len());
	let mut merged: Vec<(usize, Candidate)> = unseen;
	merged.extend(seen.into_iter().take(deficit));
	merged.sort_by_key(|(i, _)| *i);
	(merged.into_iter().map(|(_, c)| c).collect(), deficit)
}

/// First-come admission under the per-author and self-post caps, then
/// overflow backfill up to `floor`.
pub fn apply_caps(
	candidates: Vec<Candidate>,
	viewer: &str,
	floor: usize,
	options: &MixerOptions,
) -> (Vec<Candidate>, usize) {
	let mut per_author: HashMap<String, usize> = HashMap::new();
	let mut admitted = Vec::with_capacity(candidates.len());
	let mut overflow = Vec::new();
	for c in candidates {
		let cap = if c.author_id == viewer {
			options.max_self_posts
		} else {
			options.max_posts_per_author
		};
		let count = per_author.entry(c.author_id.clone()).or_insert(0);
		if *count < cap {
			*count += 1;
			admitted.push(c);
		} else {
			overflow.push(c);
		}
	}
	let deficit = floor.saturating_sub(admitted.len()).min(overflow.len());
	admitted.extend(overflow.into_iter().take(deficit));
	(admitted, deficit)
}

pub fn apply_strategy(
	strategy: MixingStrategy,
	candidates: Vec<Candidate>,
	profile: &UserPreferenceProfile,
	following: &HashSet<String>,
	features: &FeatureFlags,
	options: &MixerOptions,
) -> Vec<Candidate> {
	match strategy {
		MixingStrategy::Diversity => round_robin_by_author(candidates),
		MixingStrategy::Relevance => {
			let mut keyed: Vec<(f64, Candidate)> = candidates
				.into_iter()
				.map(|c| {
					let affinity = profile.author_affinity(&c.author_id) + profile.topic_affinity(&c.topics());
					(c.score.unwrap_or(0.0) + 0.1 * affinity, c)
				})
				.collect();
			keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
			keyed.into_iter().map(|(_, c)| c).collect()
		}
		MixingStrategy::Quality => {
			let floor = features.strictness.quality_floor();
			let mut sorted = candidates;
			sorted.sort_by(|a, b| {
				let (sa, sb) = (a.score.unwrap_or(0.0), b.score.unwrap_or(0.0));
				sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
			});
			// Below-floor items go last rather than disappearing.
			let (pass, fail): (Vec<Candidate>, Vec<Candidate>) =
				sorted.into_iter().partition(|c| c.score.unwrap_or(0.0) >= floor);
			pass.into_iter().chain(fail).collect()
		}
		MixingStrategy::Serendipity => interleave(
			candidates,
			following,
			options.serendipity_following,
			options.serendipity_discovery,
		),
		MixingStrategy::Chronological => candidates,
	}
}

/// One post per author per round, authors in first-appearance order.
pub fn round_robin_by_author(candidates: Vec<Candidate>) -> Vec<Candidate> {
	let mut order: Vec<String> = Vec::new();
	let mut groups: HashMap<String, VecDeque<Candidate>> = HashMap::new();
	for c in candidates {
		let group = groups.entry(c.author_id.clone()).or_default();
		if group.is_empty() && !order.contains(&c.author_id) {
			order.push(c.author_id.clone());
		}
		group.push_back(c);
	}
	let mut out = Vec::new();
	loop {
		let mut progressed = false;
		for author in &order {
			if let Some(c) = groups.get_mut(author).and_then(VecDeque::pop_front) {
				out.push(c);
				progressed = true;
			}
		}
		if !progressed {
			break out;
		}
	}
}

/// `per_following` followed-author items, then `per_discovery` others,
/// repeating; the remainder of whichever side is left goes last.
pub fn interleave(
	candidates: Vec<Candidate>,
	following: &HashSet<String>,
	per_following: usize,
	per_discovery: usize,
) -> Vec<Candidate> {
	let (followed, discovery): (VecDeque<Candidate>, VecDeque<Candidate>) =
		candidates.into_iter().partition(|c| following.contains(&c.author_id));
	let (mut followed, mut discovery) = (followed, discovery);
	let mut out = Vec::with_capacity(followed.len() + discovery.len());
	while !followed.is_empty() || !discovery.is_empty() {
		for _ in 0..per_following.max(1) {
			match followed.pop_front() {
				Some(c) => out.push(c),
				None => break,
			}
		}
		for _ in 0..per_discovery.max(1) {
			match discovery.pop_front() {
				Some(c) => out.push(c),
				None => break,
			}
		}
	}
	out
}

/// 1 for brand-new content, 0 at or beyond the ceiling age.
pub fn freshness_score(items: &[Candidate], now: u64, ceiling_ms: u64) -> f64 {
	if items.is_empty() {
		return 0.0;
	}
	let mean_age = items.iter().map(|c| c.age_ms(now) as f64).sum::<f64>() / items.len() as f64;
	(1.0 - mean_age / ceiling_ms.max(1) as f64).clamp(0.0, 1.0)
}

/// Mean of the unique-author ratio and the (capped) unique-topic ratio.
pub fn diversity_score(items: &[Candidate]) -> f64 {
	if items.is_empty() {
		return 0.0;
	}
	let n = items.len() as f64;
	let authors: HashSet<&str> = items.iter().map(|c| c.author_id.as_str()).collect();
	let topics: HashSet<String> = items.iter().flat_map(|c| c.topics()).collect();
	let author_ratio = authors.len() as f64 / n;
	let topic_ratio = (topics.len() as f64 / n).min(1.0);
	(author_ratio + topic_ratio) / 2.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
