// ---------------------------------------------------------------------------
// Community buckets
// ---------------------------------------------------------------------------
//
// A closed set of size tiers. Every cache, batch and learning-rate setting is
// looked up from the active bucket, so configuration is fully determined by
// the bucket and cannot be "unknown".
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::time::Duration;

const SMALL_MAX_USERS: u64 = 100;
const MEDIUM_MAX_USERS: u64 = 1_000;
const LARGE_MAX_USERS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunityBucket {
	Small,
	Medium,
	Large,
	Massive,
}

impl Default for CommunityBucket {
	fn default() -> Self {
		Self::Small
	}
}

impl CommunityBucket {
	pub const ALL: [CommunityBucket; 4] = [Self::Small, Self::Medium, Self::Large, Self::Massive];

	pub fn from_active_users(active_users: u64) -> Self {
		if active_users < SMALL_MAX_USERS {
			Self::Small
		} else if active_users < MEDIUM_MAX_USERS {
			Self::Medium
		} else if active_users < LARGE_MAX_USERS {
			Self::Large
		} else {
			Self::Massive
		}
	}

	/// Multiplier on the base learning rate. Small communities adapt faster
	/// per interaction.
	pub fn learning_rate_multiplier(self) -> f64 {
		match self {
			Self::Small => 2.0,
			Self::Medium => 1.5,
			Self::Large | Self::Massive => 1.0,
		}
	}

	/// Per-sample weight applied for the community tier.
	pub fn community_weight(self) -> f64 {
		match self {
			Self::Small => 1.2,
			Self::Medium => 1.1,
			Self::Large => 1.0,
			Self::Massive => 0.9,
		}
	}

	pub fn cache_config(self) -> CacheConfig {
		match self {
			Self::Small => CacheConfig {
				max_size: 1_000,
				ttl: Duration::from_secs(30),
				eviction: EvictionPolicy::Lru,
			},
			Self::Medium => CacheConfig {
				max_size: 5_000,
				ttl: Duration::from_secs(60),
				eviction: EvictionPolicy::Lru,
			},
			Self::Large => CacheConfig {
				max_size: 20_000,
				ttl: Duration::from_secs(120),
				eviction: EvictionPolicy::Lfu,
			},
			Self::Massive => CacheConfig {
				max_size: 50_000,
				ttl: Duration::from_secs(300),
				eviction: EvictionPolicy::Lfu,
			},
		}
	}

	pub fn batch_config(self) -> BatchConfig {
		match self {
			Self::Small => BatchConfig {
				enabled: true,
				batch_size: 5,
				timeout: Duration::from_millis(50),
				max_concurrency: 2,
			},
			Self::Medium => BatchConfig {
				enabled: true,
				batch_size: 10,
				timeout: Duration::from_millis(100),
				max_concurrency: 4,
			},
			Self::Large => BatchConfig {
				enabled: true,
				batch_size: 25,
				timeout: Duration::from_millis(150),
				max_concurrency: 8,
			},
			Self::Massive => BatchConfig {
				enabled: true,
				batch_size: 50,
				timeout: Duration::from_millis(200),
				max_concurrency: 16,
			},
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
	Lru,
	Lfu,
	Fifo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
	pub max_size: usize,
	#[serde(with = "duration_ms")]
	pub ttl: Duration,
	pub eviction: EvictionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
	pub enabled: bool,
	pub batch_size: usize,
	#[serde(with = "duration_ms")]
	pub timeout: Duration,
	pub max_concurrency: usize,
}

/// Size figures reported by the host platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommunityMetrics {
	pub active_users: u64,
	pub total_users: u64,
	pub posts_per_day: u64,
}

impl CommunityMetrics {
	pub fn bucket(&self) -> CommunityBucket {
		CommunityBucket::from_active_users(self.active_users)
	}
}

pub(crate) mod duration_ms {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_millis(u64::deserialize(d)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bucket_thresholds() {
		assert_eq!(CommunityBucket::from_active_users(0), CommunityBucket::Small);
		assert_eq!(CommunityBucket::from_active_users(99), CommunityBucket::Small);
		assert_eq!(CommunityBucket::from_active_users(100), CommunityBucket::Medium);
		assert_eq!(CommunityBucket::from_active_users(9_999), CommunityBucket::Large);
		assert_eq!(CommunityBucket::from_active_users(10_000), CommunityBucket::Massive);
	}

	#[test]
	fn ttl_and_batch_size_grow_with_bucket() {
		for pair in CommunityBucket::ALL.windows(2) {
			let (smaller, larger) = (pair[0], pair[1]);
			assert!(smaller.cache_config().ttl <= larger.cache_config().ttl);
			assert!(smaller.batch_config().batch_size <= larger.batch_config().batch_size);
			assert!(smaller.cache_config().max_size <= larger.cache_config().max_size);
		}
	}

	#[test]
	fn learning_rate_favours_small_communities() {
		assert_eq!(CommunityBucket::Small.learning_rate_multiplier(), 2.0);
		assert_eq!(CommunityBucket::Medium.learning_rate_multiplier(), 1.5);
		assert_eq!(CommunityBucket::Large.learning_rate_multiplier(), 1.0);
	}

	#[test]
	fn cache_config_serializes_ttl_as_millis() {
		let value = serde_json::to_value(CommunityBucket::Medium.cache_config()).unwrap();
		assert_eq!(value["ttl"], 60_000);
		assert_eq!(value["eviction"], "lru");
		assert_eq!(value["maxSize"], 5_000);
	}
}
