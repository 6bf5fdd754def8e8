use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

/// Opaque feature vector handed to the engagement model.
pub type FeatureMap = BTreeMap<String, f64>;

pub const HOUR_MS: u64 = 60 * 60 * 1000;
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Engagement kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngagementType {
	View,
	Click,
	Dwell,
	Like,
	Reaction,
	Bookmark,
	Reply,
	Renote,
	Share,
	Follow,
}

impl EngagementType {
	pub const ALL: [EngagementType; 10] = [
		Self::View,
		Self::Click,
		Self::Dwell,
		Self::Like,
		Self::Reaction,
		Self::Bookmark,
		Self::Reply,
		Self::Renote,
		Self::Share,
		Self::Follow,
	];

	/// Fixed base engagement score per kind.
	pub fn base_score(self) -> f64 {
		match self {
			Self::View => 0.10,
			Self::Click => 0.20,
			Self::Dwell => 0.30,
			Self::Like => 0.50,
			Self::Reaction => 0.55,
			Self::Bookmark => 0.60,
			Self::Reply => 0.70,
			Self::Renote => 0.70,
			Self::Share => 0.75,
			Self::Follow => 0.80,
		}
	}

	/// Training weight multiplier per kind.
	pub fn type_weight(self) -> f64 {
		match self {
			Self::View => 0.5,
			Self::Click => 0.8,
			Self::Dwell => 0.9,
			Self::Like | Self::Reaction => 1.0,
			Self::Bookmark => 1.2,
			Self::Reply | Self::Renote => 1.3,
			Self::Share => 1.4,
			Self::Follow => 1.5,
		}
	}

	/// Anything beyond a passive view counts toward the engagement rate.
	pub fn is_active(self) -> bool {
		self != Self::View
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::View => "view",
			Self::Click => "click",
			Self::Dwell => "dwell",
			Self::Like => "like",
			Self::Reaction => "reaction",
			Self::Bookmark => "bookmark",
			Self::Reply => "reply",
			Self::Renote => "renote",
			Self::Share => "share",
			Self::Follow => "follow",
		}
	}
}

// ---------------------------------------------------------------------------
// Candidate content
// ---------------------------------------------------------------------------

/// A visibility-filtered, unranked content item from the candidate source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Candidate {
	pub id: String,
	pub author_id: String,
	/// Epoch milliseconds.
	pub created_at: u64,
	pub text: Option<String>,
	pub tags: Vec<String>,
	pub has_media: bool,
	pub reply_id: Option<String>,
	pub reply_author_id: Option<String>,
	pub renote_id: Option<String>,
	pub reaction_count: u64,
	pub reply_count: u64,
	pub renote_count: u64,
	pub author_followers: u64,
	/// Set by the light ranker and refined by model scoring.
	pub score: Option<f64>,
}

impl Candidate {
	pub fn total_engagement(&self) -> u64 {
		self.reaction_count + 2 * self.reply_count + 3 * self.renote_count
	}

	pub fn age_ms(&self, now: u64) -> u64 {
		now.saturating_sub(self.created_at)
	}

	pub fn is_reply(&self) -> bool {
		self.reply_id.is_some()
	}

	/// Topics: explicit tags plus `#hashtags` in the text, lower-cased.
	pub fn topics(&self) -> HashSet<String> {
		let mut topics: HashSet<String> = self.tags.iter().map(|t| t.to_lowercase()).collect();
		if let Some(text) = &self.text {
			for cap in hashtag_regex().captures_iter(text) {
				topics.insert(cap[1].to_lowercase());
			}
		}
		topics
	}
}

fn hashtag_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"#(\w+)").expect("hashtag pattern is valid"))
}
