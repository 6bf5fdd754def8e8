use serde::Deserialize;

use crate::orchestrator::UserContext;
use crate::personalization::PreferenceSignal;
use crate::types::{Candidate, FeatureMap};

// JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const FEED_ERROR: i32 = -32000;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
	pub id: u64,
	pub method: String,
	#[serde(default)]
	pub params: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Param types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractFeaturesParams {
	pub candidate: Candidate,
	pub user_id: String,
	/// Overrides the follow graph when given.
	#[serde(default)]
	pub following: Option<Vec<String>>,
	#[serde(default)]
	pub include_preferences: bool,
}

impl ExtractFeaturesParams {
	pub fn user_context(&self, following: impl IntoIterator<Item = String>) -> UserContext {
		UserContext {
			user_id: self.user_id.clone(),
			following: following.into_iter().collect(),
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictParams {
	pub features: FeatureMap,
	#[serde(default)]
	pub fallback: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalParams {
	pub user_id: String,
	pub signal: PreferenceSignal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserParams {
	pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolloweesParams {
	pub user_id: String,
	pub followees: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotCreateParams {
	pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackParams {
	pub snapshot_id: String,
}
