// ---------------------------------------------------------------------------
// Light Ranker — single-pass heuristic prefilter
// ---------------------------------------------------------------------------
//
// Reduces a large unranked candidate pool to a bounded, high-quality subset
// before expensive model scoring. One batched follow-graph lookup per call.
//
//   score = 0.20 * recency + 0.50 * velocity + 0.20 * author_quality
//         + 0.10 * relationship + content_bonus - penalties
//
// The minimum-score filter is relaxed whenever it would starve downstream
// stages.
// ---------------------------------------------------------------------------

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::FeedError;
use crate::types::{now_ms, Candidate, DAY_MS, HOUR_MS};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const RECENCY_WEIGHT: f64 = 0.20;
const VELOCITY_WEIGHT: f64 = 0.50;
const AUTHOR_WEIGHT: f64 = 0.20;
const RELATIONSHIP_WEIGHT: f64 = 0.10;

const RECENCY_HALF_LIFE_MS: f64 = 7.0 * DAY_MS as f64;
const FRESH_WINDOW_MS: u64 = DAY_MS;
const VELOCITY_RATE_CAP: f64 = 10.0;
const VELOCITY_TOTAL_CAP: f64 = 100.0;
const FOLLOWER_CAP: f64 = 1_000.0;

const STALE_AFTER_MS: u64 = 30 * DAY_MS;
const STALE_PENALTY: f64 = 0.10;
const DEAD_AFTER_MS: u64 = 48 * HOUR_MS;
const DEAD_PENALTY: f64 = 0.05;

// ---------------------------------------------------------------------------
// Follow graph
// ---------------------------------------------------------------------------

/// Batched relationship lookup: the full followee set of a user.
#[async_trait]
pub trait FollowGraph: Send + Sync {
	async fn followees(&self, user_id: &str) -> Result<HashSet<String>, FeedError>;
}

/// A follow graph backed by a pre-fetched followee set.
pub struct StaticFollowGraph {
	followees: HashSet<String>,
}

impl StaticFollowGraph {
	pub fn new(followees: impl IntoIterator<Item = String>) -> Self {
		Self {
			followees: followees.into_iter().collect(),
		}
	}
}

#[async_trait]
impl FollowGraph for StaticFollowGraph {
	async fn followees(&self, _user_id: &str) -> Result<HashSet<String>, FeedError> {
		Ok(self.followees.clone())
	}
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LightRankOptions {
	/// Fraction of the pool to keep.
	pub top_percent: f64,
	pub min_score: f64,
	/// Below `max(relax_min_count, relax_min_fraction * n)` passing candidates
	/// the threshold is discarded.
	pub relax_min_count: usize,
	pub relax_min_fraction: f64,
	/// Survivors guaranteed whenever the pool is at least this large.
	pub min_survivors: usize,
}

impl Default for LightRankOptions {
	fn default() -> Self {
		Self {
			top_percent: 0.3,
			min_score: 0.1,
			relax_min_count: 10,
			relax_min_fraction: 0.1,
			min_survivors: 50,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightRankResult {
	/// Survivors, best first, each with `score` set.
	pub candidates: Vec<Candidate>,
	pub input_count: usize,
	pub passing_count: usize,
	pub relaxed: bool,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

pub fn recency_component(candidate: &Candidate, now: u64) -> f64 {
	let age = candidate.age_ms(now) as f64;
	(-(f64::ln(2.0) / RECENCY_HALF_LIFE_MS) * age).exp()
}

/// Engagement rate per hour for content under a day old, capped total for
/// older content.
pub fn velocity_component(candidate: &Candidate, now: u64) -> f64 {
	let total = candidate.total_engagement() as f64;
	let age_ms = candidate.age_ms(now);
	if age_ms < FRESH_WINDOW_MS {
		let age_hours = (age_ms as f64 / HOUR_MS as f64).max(1.0);
		(total / age_hours / VELOCITY_RATE_CAP).min(1.0)
	} else {
		(total / VELOCITY_TOTAL_CAP).min(1.0)
	}
}

pub fn author_quality_component(candidate: &Candidate) -> f64 {
	(candidate.author_followers as f64 / FOLLOWER_CAP).min(1.0)
}

pub fn content_bonus(candidate: &Candidate) -> f64 {
	let mut bonus = 0.0;
	if let Some(text) = &candidate.text {
		let len = text.chars().count();
		if (20..=500).contains(&len) {
			bonus += 0.05;
		}
	}
	if candidate.has_media {
		bonus += 0.03;
	}
	if !candidate.tags.is_empty() {
		bonus += 0.02;
	}
	bonus
}

pub fn penalties(candidate: &Candidate, now: u64) -> f64 {
	let age = candidate.age_ms(now);
	let mut penalty = 0.0;
	if age > STALE_AFTER_MS {
		penalty += STALE_PENALTY;
	}
	if candidate.total_engagement() == 0 && age > DEAD_AFTER_MS {
		penalty += DEAD_PENALTY;
	}
	penalty
}

pub fn light_score(candidate: &Candidate, followees: &HashSet<String>, now: u64) -> f64 {
	let relationship = if followees.contains(&candidate.author_id) {
		1.0
	} else {
		0.0
	};
	let score = RECENCY_WEIGHT * recency_component(candidate, now)
		+ VELOCITY_WEIGHT * velocity_component(candidate, now)
		+ AUTHOR_WEIGHT * author_quality_component(candidate)
		+ RELATIONSHIP_WEIGHT * relationship
		+ content_bonus(candidate)
		- penalties(candidate, now);
	score.max(0.0)
}

// ---------------------------------------------------------------------------
// LightRanker
// ---------------------------------------------------------------------------

/// Light ranking bound to a follow graph and default options.
pub struct LightRanker {
	defaults: LightRankOptions,
	graph: Arc<dyn FollowGraph>,
}

impl LightRanker {
	pub fn new(defaults: LightRankOptions, graph: Arc<dyn FollowGraph>) -> Self {
		Self { defaults, graph }
	}

	pub fn defaults(&self) -> &LightRankOptions {
		&self.defaults
	}

	/// One batched relationship lookup. A failed lookup degrades to
	/// "follows nobody" rather than failing the request.
	pub async fn followees(&self, user_id: &str) -> HashSet<String> {
		match self.graph.followees(user_id).await {
			Ok(set) => set,
			Err(e) => {
				tracing::warn!(user_id, error = %e, "Follow graph lookup failed; ranking without relationships");
				HashSet::new()
			}
		}
	}

	/// Score and filter against followees the caller already fetched.
	pub fn rank(&self, candidates: Vec<Candidate>, followees: &HashSet<String>) -> LightRankResult {
		rank_with_followees(candidates, followees, &self.defaults, now_ms())
	}
}

/// Score, sort and filter `candidates` at time `now`.
pub fn rank_with_followees(
	candidates: Vec<Candidate>,
	followees: &HashSet<String>,
	options: &LightRankOptions,
	now: u64,
) -> LightRankResult {
	let input_count = candidates.len();
	let mut scored: Vec<Candidate> = candidates
		.into_iter()
		.map(|mut c| {
			c.score = Some(light_score(&c, followees, now));
			c
		})
		.collect();
	scored.sort_by(|a, b| {
		b.score
			.unwrap_or(0.0)
			.partial_cmp(&a.score.unwrap_or(0.0))
			.unwrap_or(std::cmp::Ordering::Equal)
	});

	let passing_count = scored
		.iter()
		.filter(|c| c.score.unwrap_or(0.0) >= options.min_score)
		.count();
	let target = (input_count as f64 * options.top_percent).ceil() as usize;
	let relax_floor = options
		.relax_min_count
		.max((input_count as f64 * options.relax_min_fraction).ceil() as usize);
	let survivor_floor = options.min_survivors.min(input_count);

	let relaxed = passing_count < relax_floor;
	let keep = if relaxed {
		target.max(survivor_floor)
	} else {
		target.min(passing_count).max(survivor_floor)
	}
	.min(input_count);

	if relaxed && input_count > 0 {
		tracing::debug!(
			input_count,
			passing_count,
			keep,
			"Light rank threshold relaxed to avoid starvation"
		);
	}

	scored.truncate(keep);
	LightRankResult {
		candidates: scored,
		input_count,
		passing_count,
		relaxed,
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
