// ---------------------------------------------------------------------------
// Online Learning Buffer
// ---------------------------------------------------------------------------
//
// Fixed-capacity ring of scored training samples plus a per-user behaviour
// pattern derived from each user's bounded recent window.
//
// 1. Ring storage — samples are only ever overwritten by wraparound, never
//    deleted individually; length never exceeds capacity.
// 2. Behaviour patterns — interaction count, EMA of engagement, rolling
//    engagement rate, and top-3 kinds / hours recomputed from the last
//    `recent_window` interactions of that user.
// 3. Global rate — the mean engagement rate across tracked users is kept as a
//    running sum so insertion stays O(1) amortized.
// ---------------------------------------------------------------------------

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::community::CommunityBucket;
use crate::scoring::{recency_decay, score_engagement, EngagementInput};
use crate::types::{now_ms, EngagementType, FeatureMap};

const TOP_N: usize = 3;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BufferOptions {
	pub capacity: usize,
	pub base_learning_rate: f64,
	pub ema_alpha: f64,
	pub recent_window: usize,
	pub max_tracked_users: usize,
}

impl Default for BufferOptions {
	fn default() -> Self {
		Self {
			capacity: 10_000,
			base_learning_rate: 1.0,
			ema_alpha: 0.1,
			recent_window: 100,
			max_tracked_users: 10_000,
		}
	}
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSample {
	pub features: FeatureMap,
	pub engagement_score: f64,
	pub engagement_type: EngagementType,
	pub timestamp: u64,
	pub recorded_at: u64,
	pub weight: f64,
	pub user_id: String,
	pub content_id: String,
	pub session_id: Option<String>,
	pub device_type: Option<String>,
	pub community_bucket: CommunityBucket,
}

impl TrainingSample {
	/// Weight further decayed by the time elapsed since the sample was recorded.
	pub fn effective_weight(&self, now: u64) -> f64 {
		self.weight * recency_decay(self.recorded_at, now)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBehaviorPattern {
	pub user_id: String,
	pub total_interactions: u64,
	pub engagement_rate: f64,
	pub average_engagement: f64,
	pub preferred_types: Vec<EngagementType>,
	pub peak_hours: Vec<u32>,
	pub last_active_time: u64,
}

/// One interaction to be scored and stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleInput {
	pub user_id: String,
	pub features: FeatureMap,
	pub engagement_type: EngagementType,
	pub content_id: String,
	#[serde(default)]
	pub session_id: Option<String>,
	#[serde(default)]
	pub device_type: Option<String>,
	/// When the interaction happened; defaults to the insertion time.
	#[serde(default)]
	pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
	pub size: usize,
	pub capacity: usize,
	pub total_added: u64,
	pub tracked_users: usize,
	pub community_bucket: CommunityBucket,
	pub global_engagement_rate: f64,
	pub average_score: f64,
	pub average_weight: f64,
	pub by_type: BTreeMap<String, u64>,
}

struct UserState {
	pattern: UserBehaviorPattern,
	/// (kind, hour-of-day) of the most recent interactions, oldest first.
	recent: VecDeque<(EngagementType, u32)>,
}

// ---------------------------------------------------------------------------
// OnlineLearningBuffer
// ---------------------------------------------------------------------------

pub struct OnlineLearningBuffer {
	options: BufferOptions,
	ring: Vec<TrainingSample>,
	/// Next slot to overwrite once the ring is full.
	head: usize,
	total_added: u64,
	users: HashMap<String, UserState>,
	global_rate_sum: f64,
	bucket: CommunityBucket,
	kind_counts: BTreeMap<EngagementType, u64>,
}

impl OnlineLearningBuffer {
	pub fn new(options: BufferOptions) -> Self {
		let capacity = options.capacity.max(1);
		Self {
			options: BufferOptions { capacity, ..options },
			ring: Vec::with_capacity(capacity.min(4_096)),
			head: 0,
			total_added: 0,
			users: HashMap::new(),
			global_rate_sum: 0.0,
			bucket: CommunityBucket::default(),
			kind_counts: BTreeMap::new(),
		}
	}

	pub fn set_community_bucket(&mut self, bucket: CommunityBucket) {
		self.bucket = bucket;
	}

	pub fn community_bucket(&self) -> CommunityBucket {
		self.bucket
	}

	/// Score an interaction, store it, and update the user's pattern.
	pub fn add_sample(&mut self, input: SampleInput) -> TrainingSample {
		self.add_sample_at(input, now_ms())
	}

	pub fn add_sample_at(&mut self, input: SampleInput, now: u64) -> TrainingSample {
		let timestamp = input.timestamp.unwrap_or(now);
		let global_avg_rate = self.global_engagement_rate();

		let scored = score_engagement(
			&EngagementInput {
				kind: input.engagement_type,
				timestamp,
				pattern: self.users.get(&input.user_id).map(|s| &s.pattern),
				global_avg_rate,
				bucket: self.bucket,
				base_learning_rate: self.options.base_learning_rate,
			},
			now,
		);

		let sample = TrainingSample {
			features: input.features,
			engagement_score: scored.score,
			engagement_type: input.engagement_type,
			timestamp,
			recorded_at: now,
			weight: scored.weight,
			user_id: input.user_id,
			content_id: input.content_id,
			session_id: input.session_id,
			device_type: input.device_type,
			community_bucket: self.bucket,
		};

		self.update_pattern(&sample);
		self.push(sample.clone());
		*self.kind_counts.entry(sample.engagement_type).or_insert(0) += 1;
		sample
	}

	fn push(&mut self, sample: TrainingSample) {
		if self.ring.len() < self.options.capacity {
			self.ring.push(sample);
		} else {
			self.ring[self.head] = sample;
			self.head = (self.head + 1) % self.options.capacity;
		}
		self.total_added += 1;
	}

	fn update_pattern(&mut self, sample: &TrainingSample) {
		let hour = DateTime::<Utc>::from_timestamp_millis(sample.timestamp as i64)
			.map(|dt| dt.hour())
			.unwrap_or(0);
		let alpha = self.options.ema_alpha;
		let window = self.options.recent_window.max(1);

		let state = self
			.users
			.entry(sample.user_id.clone())
			.or_insert_with(|| UserState {
				pattern: UserBehaviorPattern {
					user_id: sample.user_id.clone(),
					total_interactions: 0,
					engagement_rate: 0.0,
					average_engagement: 0.0,
					preferred_types: Vec::new(),
					peak_hours: Vec::new(),
					last_active_time: 0,
				},
				recent: VecDeque::with_capacity(window),
			});

		let old_rate = state.pattern.engagement_rate;

		state.recent.push_back((sample.engagement_type, hour));
		while state.recent.len() > window {
			state.recent.pop_front();
		}

		let p = &mut state.pattern;
		p.average_engagement = if p.total_interactions == 0 {
			sample.engagement_score
		} else {
			alpha * sample.engagement_score + (1.0 - alpha) * p.average_engagement
		};
		p.total_interactions += 1;
		p.last_active_time = p.last_active_time.max(sample.timestamp);

		let active = state.recent.iter().filter(|(k, _)| k.is_active()).count();
		p.engagement_rate = active as f64 / state.recent.len() as f64;
		p.preferred_types = top_n(state.recent.iter().map(|(k, _)| *k));
		p.peak_hours = top_n(state.recent.iter().map(|(_, h)| *h));

		self.global_rate_sum += p.engagement_rate - old_rate;

		if self.users.len() > self.options.max_tracked_users {
			self.evict_least_recent_user(&sample.user_id);
		}
	}

	fn evict_least_recent_user(&mut self, keep: &str) {
		let victim = self
			.users
			.iter()
			.filter(|(id, _)| id.as_str() != keep)
			.min_by_key(|(_, s)| s.pattern.last_active_time)
			.map(|(id, _)| id.clone());
		if let Some(id) = victim {
			if let Some(state) = self.users.remove(&id) {
				self.global_rate_sum -= state.pattern.engagement_rate;
			}
		}
	}

	// -- Queries --------------------------------------------------------------

	pub fn len(&self) -> usize {
		self.ring.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ring.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.options.capacity
	}

	pub fn total_added(&self) -> u64 {
		self.total_added
	}

	/// Samples in arrival order, oldest first.
	pub fn iter(&self) -> impl Iterator<Item = &TrainingSample> {
		let (newer, older) = self.ring.split_at(self.head);
		older.iter().chain(newer.iter())
	}

	/// The `n` most recent samples, oldest first, each with its weight
	/// re-decayed to `now`.
	pub fn training_batch(&self, n: usize, now: u64) -> Vec<TrainingSample> {
		let skip = self.ring.len().saturating_sub(n);
		self.iter()
			.skip(skip)
			.map(|s| TrainingSample {
				weight: s.effective_weight(now),
				..s.clone()
			})
			.collect()
	}

	pub fn user_pattern(&self, user_id: &str) -> Option<&UserBehaviorPattern> {
		self.users.get(user_id).map(|s| &s.pattern)
	}

	pub fn global_engagement_rate(&self) -> f64 {
		if self.users.is_empty() {
			0.0
		} else {
			(self.global_rate_sum / self.users.len() as f64).max(0.0)
		}
	}

	pub fn stats(&self) -> BufferStats {
		let n = self.ring.len();
		let (score_sum, weight_sum) = self
			.ring
			.iter()
			.fold((0.0, 0.0), |(s, w), x| (s + x.engagement_score, w + x.weight));
		BufferStats {
			size: n,
			capacity: self.options.capacity,
			total_added: self.total_added,
			tracked_users: self.users.len(),
			community_bucket: self.bucket,
			global_engagement_rate: self.global_engagement_rate(),
			average_score: if n == 0 { 0.0 } else { score_sum / n as f64 },
			average_weight: if n == 0 { 0.0 } else { weight_sum / n as f64 },
			by_type: self
				.kind_counts
				.iter()
				.map(|(k, v)| (k.as_str().to_string(), *v))
				.collect(),
		}
	}
}

/// Most frequent values; ties go to the smaller value.
fn top_n<T: Ord + Copy>(values: impl Iterator<Item = T>) -> Vec<T> {
	let mut counts: BTreeMap<T, usize> = BTreeMap::new();
	for v in values {
		*counts.entry(v).or_insert(0) += 1;
	}
	let mut ranked: Vec<(T, usize)> = counts.into_iter().collect();
	ranked.sort_by(|a, b| b.1.cmp(&a.1));
	ranked.into_iter().take(TOP_N).map(|(v, _)| v).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::HOUR_MS;

	fn input(user: &str, kind: EngagementType, content: &str) -> SampleInput {
		SampleInput {
			user_id: user.into(),
			features: FeatureMap::new(),
			engagement_type: kind,
			content_id: content.into(),
			session_id: None,
			device_type: None,
			timestamp: None,
		}
	}

	fn small_buffer(capacity: usize) -> OnlineLearningBuffer {
		OnlineLearningBuffer::new(BufferOptions {
			capacity,
			..Default::default()
		})
	}

	// -- ring -----------------------------------------------------------------

	#[test]
	fn ring_keeps_exactly_capacity_in_arrival_order() {
		let mut buf = small_buffer(5);
		for i in 0..8 {
			buf.add_sample_at(input("u1", EngagementType::Like, &format!("c{i}")), 1_000 + i);
		}
		assert_eq!(buf.len(), 5);
		assert_eq!(buf.total_added(), 8);
		let ids: Vec<&str> = buf.iter().map(|s| s.content_id.as_str()).collect();
		assert_eq!(ids, vec!["c3", "c4", "c5", "c6", "c7"]);
	}

	#[test]
	fn ring_below_capacity_preserves_order() {
		let mut buf = small_buffer(10);
		for i in 0..3 {
			buf.add_sample_at(input("u1", EngagementType::View, &format!("c{i}")), 1_000);
		}
		let ids: Vec<&str> = buf.iter().map(|s| s.content_id.as_str()).collect();
		assert_eq!(ids, vec!["c0", "c1", "c2"]);
	}

	#[test]
	fn training_batch_returns_most_recent_with_decay() {
		let mut buf = small_buffer(10);
		for i in 0..4 {
			buf.add_sample_at(input("u1", EngagementType::Like, &format!("c{i}")), 0);
		}
		let batch = buf.training_batch(2, 2 * HOUR_MS);
		assert_eq!(batch.len(), 2);
		assert_eq!(batch[0].content_id, "c2");
		assert_eq!(batch[1].content_id, "c3");
		let original = buf.iter().last().unwrap().weight;
		assert!((batch[1].weight - original * 0.5).abs() < 1e-9);
	}

	// -- patterns -------------------------------------------------------------

	#[test]
	fn pattern_tracks_rate_ema_and_top_types() {
		let mut buf = small_buffer(100);
		buf.add_sample_at(input("u1", EngagementType::View, "a"), 1_000);
		buf.add_sample_at(input("u1", EngagementType::Like, "b"), 2_000);
		buf.add_sample_at(input("u1", EngagementType::Like, "c"), 3_000);
		buf.add_sample_at(input("u1", EngagementType::Reply, "d"), 4_000);

		let p = buf.user_pattern("u1").unwrap();
		assert_eq!(p.total_interactions, 4);
		assert!((p.engagement_rate - 0.75).abs() < 1e-12);
		assert_eq!(p.preferred_types[0], EngagementType::Like);
		assert_eq!(p.preferred_types.len(), 3);
		assert_eq!(p.last_active_time, 4_000);
		assert_eq!(p.peak_hours, vec![0]);
		assert!(p.average_engagement > 0.0);
	}

	#[test]
	fn recent_window_bounds_pattern_history() {
		let mut buf = OnlineLearningBuffer::new(BufferOptions {
			capacity: 100,
			recent_window: 3,
			..Default::default()
		});
		for i in 0..3 {
			buf.add_sample_at(input("u1", EngagementType::View, &format!("v{i}")), 1_000);
		}
		for i in 0..3 {
			buf.add_sample_at(input("u1", EngagementType::Share, &format!("s{i}")), 2_000);
		}
		let p = buf.user_pattern("u1").unwrap();
		assert_eq!(p.engagement_rate, 1.0);
		assert_eq!(p.preferred_types, vec![EngagementType::Share]);
	}

	#[test]
	fn global_rate_is_mean_of_users() {
		let mut buf = small_buffer(100);
		buf.add_sample_at(input("a", EngagementType::View, "1"), 1_000);
		buf.add_sample_at(input("b", EngagementType::Like, "2"), 1_000);
		assert!((buf.global_engagement_rate() - 0.5).abs() < 1e-12);
	}

	#[test]
	fn tracked_users_are_bounded() {
		let mut buf = OnlineLearningBuffer::new(BufferOptions {
			capacity: 100,
			max_tracked_users: 2,
			..Default::default()
		});
		buf.add_sample_at(input("old", EngagementType::Like, "1"), 1_000);
		buf.add_sample_at(input("mid", EngagementType::Like, "2"), 2_000);
		buf.add_sample_at(input("new", EngagementType::Like, "3"), 3_000);
		assert!(buf.user_pattern("old").is_none());
		assert!(buf.user_pattern("new").is_some());
		assert_eq!(buf.stats().tracked_users, 2);
	}

	#[test]
	fn small_bucket_assigns_larger_weights() {
		let mut small = small_buffer(10);
		small.set_community_bucket(CommunityBucket::Small);
		let mut large = small_buffer(10);
		large.set_community_bucket(CommunityBucket::Large);
		let a = small.add_sample_at(input("u", EngagementType::Like, "c"), 1_000);
		let b = large.add_sample_at(input("u", EngagementType::Like, "c"), 1_000);
		assert!(a.weight > b.weight);
		assert_eq!(a.community_bucket, CommunityBucket::Small);
	}

	#[test]
	fn stats_count_by_type() {
		let mut buf = small_buffer(10);
		buf.add_sample_at(input("u", EngagementType::Like, "c1"), 1_000);
		buf.add_sample_at(input("u", EngagementType::Like, "c2"), 1_000);
		buf.add_sample_at(input("u", EngagementType::Follow, "c3"), 1_000);
		let stats = buf.stats();
		assert_eq!(stats.by_type["like"], 2);
		assert_eq!(stats.by_type["follow"], 1);
		assert_eq!(stats.size, 3);
	}
}
