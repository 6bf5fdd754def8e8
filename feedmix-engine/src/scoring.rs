// ---------------------------------------------------------------------------
// Engagement Scorer — continuous, user-adapted engagement scores
// ---------------------------------------------------------------------------
//
// Pure functions that turn a raw interaction into an engagement score and a
// training weight. No side effects; the learning buffer owns all state.
//
//   score  = base(kind) * adaptation(user) * (1 + temporal_boost * 0.1)
//   weight = score * type_weight(kind) * recency_decay * community_weight
//            * adaptive_learning_rate(bucket)
// ---------------------------------------------------------------------------

use crate::community::CommunityBucket;
use crate::learning_buffer::UserBehaviorPattern;
use crate::types::{EngagementType, HOUR_MS};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const ADAPTATION_MIN: f64 = 0.5;
const ADAPTATION_MAX: f64 = 2.0;
const PREFERRED_TYPE_BOOST: f64 = 1.2;
const TEMPORAL_BOOST_FACTOR: f64 = 0.1;
const TEMPORAL_SCALE_HOURS: f64 = 24.0;
const MAX_SCORE: f64 = 2.0;

/// Half-life of the sample recency decay: 2 hours.
pub const RECENCY_HALF_LIFE_MS: f64 = 2.0 * HOUR_MS as f64;

// ---------------------------------------------------------------------------
// Individual factors
// ---------------------------------------------------------------------------

/// How much to scale a user's signal relative to the population.
///
/// Users who rarely engage get amplified (up to 2x), heavy engagers get
/// damped (down to 0.5x). Unknown users and users with no measurable rate
/// are left at 1.0.
pub fn user_adaptation(
	kind: EngagementType,
	pattern: Option<&UserBehaviorPattern>,
	global_avg_rate: f64,
) -> f64 {
	let Some(pattern) = pattern else {
		return 1.0;
	};
	let mut adaptation = if pattern.engagement_rate > 0.0 && global_avg_rate > 0.0 {
		(global_avg_rate / pattern.engagement_rate)
			.sqrt()
			.clamp(ADAPTATION_MIN, ADAPTATION_MAX)
	} else {
		1.0
	};
	if pattern.preferred_types.contains(&kind) {
		adaptation *= PREFERRED_TYPE_BOOST;
	}
	adaptation
}

/// `exp(-hours_since_last_active / 24)`; zero for users never seen before.
pub fn temporal_boost(last_active: Option<u64>, now: u64) -> f64 {
	match last_active {
		Some(ts) => {
			let hours = now.saturating_sub(ts) as f64 / HOUR_MS as f64;
			(-hours / TEMPORAL_SCALE_HOURS).exp()
		}
		None => 0.0,
	}
}

/// Exponential decay with a 2-hour half-life. 1.0 at `now`, 0.5 two hours
/// earlier.
pub fn recency_decay(timestamp: u64, now: u64) -> f64 {
	let age_ms = now.saturating_sub(timestamp) as f64;
	let lambda = f64::ln(2.0) / RECENCY_HALF_LIFE_MS;
	(-lambda * age_ms).exp()
}

pub fn adaptive_learning_rate(base_rate: f64, bucket: CommunityBucket) -> f64 {
	base_rate * bucket.learning_rate_multiplier()
}

// ---------------------------------------------------------------------------
// Combined score
// ---------------------------------------------------------------------------

pub struct EngagementInput<'a> {
	pub kind: EngagementType,
	pub timestamp: u64,
	pub pattern: Option<&'a UserBehaviorPattern>,
	pub global_avg_rate: f64,
	pub bucket: CommunityBucket,
	pub base_learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredEngagement {
	pub score: f64,
	pub weight: f64,
}

pub fn score_engagement(input: &EngagementInput<'_>, now: u64) -> ScoredEngagement {
	let adaptation = user_adaptation(input.kind, input.pattern, input.global_avg_rate);
	let boost = temporal_boost(input.pattern.map(|p| p.last_active_time), input.timestamp);
	let score = (input.kind.base_score() * adaptation * (1.0 + boost * TEMPORAL_BOOST_FACTOR))
		.clamp(0.0, MAX_SCORE);

	let weight = score
		* input.kind.type_weight()
		* recency_decay(input.timestamp, now)
		* input.bucket.community_weight()
		* adaptive_learning_rate(input.base_learning_rate, input.bucket);

	ScoredEngagement {
		score,
		weight: weight.max(0.0),
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
